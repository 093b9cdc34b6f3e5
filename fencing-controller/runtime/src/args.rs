use crate::{
    admission::Admission,
    controller::{self, Controller},
    core::RetryPolicy,
    index,
    k8s::{labels, watcher, Client, Cluster, Pod, Resource},
    lease,
    metrics::ExecutorMetrics,
    status,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

// The maximum number of status patches to buffer.
const STATUS_UPDATE_QUEUE_SIZE: usize = 1_000;

#[derive(Debug, Parser)]
#[clap(
    name = "fencing-controller",
    about = "Fences and unfences PostgreSQL cluster instances"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "pg_fencing_controller=info,warn",
        env = "PG_FENCING_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    #[clap(long, default_value = "pg-fencing-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "pg-fencing-system")]
    controller_namespace: String,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// Bounds each fence or unfence operation, including waiting for an
    /// unfenced replica to resume streaming.
    #[clap(long, default_value = "30000")]
    executor_timeout_ms: u64,

    #[clap(long, default_value = "10000")]
    reconciliation_period_ms: u64,

    /// The name of the database container in instance pods.
    #[clap(long, default_value = labels::POSTGRES_CONTAINER)]
    postgres_container: String,

    #[clap(long, default_value = "/var/lib/postgresql/data/pgdata", env = "PGDATA")]
    pgdata: String,

    #[clap(long, default_value = "1000")]
    retry_base_ms: u64,

    #[clap(long, default_value = "60000")]
    retry_max_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            controller_deployment_name,
            controller_namespace,
            patch_timeout_ms,
            executor_timeout_ms,
            reconciliation_period_ms,
            postgres_container,
            pgdata,
            retry_base_ms,
            retry_max_ms,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        if retry_base_ms == 0 || retry_base_ms > retry_max_ms {
            bail!("--retry-base-ms must be positive and no greater than --retry-max-ms");
        }
        let config = controller::Config {
            executor_timeout: Duration::from_millis(executor_timeout_ms),
            reconciliation_period: Duration::from_millis(reconciliation_period_ms),
            container: postgres_container,
            pgdata,
            retry: RetryPolicy {
                base: Duration::from_millis(retry_base_ms),
                max: Duration::from_millis(retry_max_ms),
            },
        };

        let mut prom = <Registry>::default();
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("cluster_status"));
        let executor_metrics =
            ExecutorMetrics::register(prom.sub_registry_with_prefix("fencing"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        if !api_resource_exists::<Cluster>(&runtime.client()).await {
            bail!(
                "{} resource kind not found; is the CRD installed?",
                Cluster::api_version(&())
            );
        }

        let hostname =
            std::env::var("HOSTNAME").context("failed to fetch `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        // Build the index of clusters and their instances. Every change to
        // either is reported on the triggers channel.
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();
        let index = index::Index::shared(triggers_tx);

        let clusters = runtime.watch_all::<Cluster>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), clusters).instrument(info_span!("clusters")),
        );

        let pods = runtime.watch_all::<Pod>(watcher::Config::default().labels(labels::CLUSTER_LABEL));
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_controller = status::Controller::new(
            claims.clone(),
            runtime.client(),
            hostname.clone(),
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        let controller = Controller::new(
            config,
            runtime.client(),
            index,
            triggers_rx,
            claims,
            hostname,
            updates_tx,
            executor_metrics,
        );
        let guards = controller.guards();
        tokio::spawn(controller.run().instrument(info_span!("fencing")));

        let runtime = runtime.spawn_server(move || Admission::new(guards.clone()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
