use anyhow::{bail, Context, Result};
use pg_fencing_controller_core::{executor::ConnectionControl, InstanceId};
use pg_fencing_controller_k8s_api::{
    labels, Api, AttachParams, Client, Patch, PatchParams, Pod, Status,
};
use tokio::io::AsyncReadExt;

/// `pg_ctl status` exits with 3 when the server is not running.
const PG_CTL_NOT_RUNNING: i32 = 3;

const WAL_RECEIVERS_QUERY: &str = "SELECT count(*) FROM pg_stat_wal_receiver";

/// Controls an instance's PostgreSQL server by running `pg_ctl` in its
/// database container.
///
/// Stopping the server leaves the data directory and the standby
/// configuration untouched, so a replica that is started again resumes
/// streaming from its primary.
#[derive(Clone)]
pub struct PodExec {
    api: Api<Pod>,
    container: String,
    pgdata: String,
}

#[derive(Debug)]
struct Output {
    code: i32,
    stdout: String,
}

// === impl PodExec ===

impl PodExec {
    pub fn new(client: Client, namespace: &str, container: String, pgdata: String) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            container,
            pgdata,
        }
    }

    async fn exec(&self, instance: &InstanceId, command: Vec<String>) -> Result<Output> {
        tracing::trace!(%instance, ?command, "Executing");
        let params = AttachParams::default()
            .container(self.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(false);
        let mut process = self
            .api
            .exec(instance.as_str(), command, &params)
            .await
            .with_context(|| format!("failed to exec in pod {instance}"))?;

        let mut stdout = String::new();
        if let Some(mut out) = process.stdout() {
            out.read_to_string(&mut stdout)
                .await
                .context("failed to read command output")?;
        }
        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        process.join().await.context("exec session failed")?;

        let code = exit_code(status.as_ref())?;
        Ok(Output { code, stdout })
    }

    async fn pg_ctl(&self, instance: &InstanceId, args: &[&str]) -> Result<Output> {
        let command = ["pg_ctl", "-D", self.pgdata.as_str()]
            .iter()
            .chain(args)
            .map(|s| s.to_string())
            .collect();
        self.exec(instance, command).await
    }
}

#[async_trait::async_trait]
impl ConnectionControl for PodExec {
    async fn is_accepting(&self, instance: &InstanceId) -> Result<bool> {
        match self.pg_ctl(instance, &["status"]).await?.code {
            0 => Ok(true),
            PG_CTL_NOT_RUNNING => Ok(false),
            code => bail!("pg_ctl status exited with {code}"),
        }
    }

    async fn refuse_connections(&self, instance: &InstanceId) -> Result<()> {
        let output = self.pg_ctl(instance, &["stop", "-m", "fast", "-w"]).await?;
        if output.code != 0 {
            bail!("pg_ctl stop exited with {}", output.code);
        }
        Ok(())
    }

    async fn accept_connections(&self, instance: &InstanceId) -> Result<()> {
        let output = self.pg_ctl(instance, &["start", "-w"]).await?;
        if output.code != 0 {
            bail!("pg_ctl start exited with {}", output.code);
        }
        Ok(())
    }

    async fn mark_fenced(&self, instance: &InstanceId, fenced: bool) -> Result<()> {
        self.api
            .patch(
                instance.as_str(),
                &PatchParams::default(),
                &Patch::Merge(marker_patch(fenced)),
            )
            .await
            .with_context(|| format!("failed to update fence marker on pod {instance}"))?;
        Ok(())
    }

    async fn wal_receivers(&self, instance: &InstanceId) -> Result<u32> {
        let command = ["psql", "-U", "postgres", "-tAc", WAL_RECEIVERS_QUERY]
            .map(String::from)
            .to_vec();
        let output = self.exec(instance, command).await?;
        if output.code != 0 {
            bail!("psql exited with {}", output.code);
        }
        output
            .stdout
            .trim()
            .parse()
            .with_context(|| format!("unexpected WAL receiver count {:?}", output.stdout))
    }
}

fn marker_patch(fenced: bool) -> serde_json::Value {
    let value = fenced.then_some("true");
    serde_json::json!({
        "metadata": {
            "annotations": {
                (labels::FENCED_MARKER_ANNOTATION): value,
            },
        },
    })
}

/// Extracts a command's exit code from the status reported at the end of an
/// exec session.
fn exit_code(status: Option<&Status>) -> Result<i32> {
    let Some(status) = status else {
        bail!("exec session ended without a status");
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }

    let code = status
        .details
        .iter()
        .flat_map(|d| d.causes.iter().flatten())
        .find(|c| c.reason.as_deref() == Some("ExitCode"))
        .and_then(|c| c.message.as_deref());
    match code {
        Some(code) => code
            .parse()
            .with_context(|| format!("invalid exit code {code:?}")),
        None => bail!(
            "command failed: {}",
            status.message.as_deref().unwrap_or("unknown error")
        ),
    }
}
