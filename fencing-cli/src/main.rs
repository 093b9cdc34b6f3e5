#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use pg_fencing_controller_core::{
    command::{self, Command, Target},
    FencingSet,
};
use pg_fencing_controller_k8s_api::Client;
use pg_fencing_controller_k8s_client::ClusterDeclarations;
use tokio::time;
use tracing::debug;

/// Fence or unfence the instances of a PostgreSQL cluster
///
/// Fenced instances stop accepting connections but keep their role; an
/// instance name of `*` addresses every instance in the cluster.
#[derive(Debug, Parser)]
#[clap(name = "pg-fence", version, about)]
struct Args {
    #[clap(long, env = "PG_FENCE_LOG_LEVEL", default_value = "warn")]
    log_level: kubert::LogFilter,

    #[clap(long, env = "PG_FENCE_LOG_FORMAT", default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Namespace of the cluster; defaults to the kubeconfig's namespace
    #[clap(long, short = 'n')]
    namespace: Option<String>,

    /// Name of the Cluster resource
    #[clap(long, short = 'c')]
    cluster: String,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Fence an instance, or every instance with `*`
    On { target: Target },

    /// Unfence an instance, or every instance with `*`
    Off { target: Target },

    /// Replace the declaration with a JSON array of instance names
    Set { fenced_instances: FencingSet },
}

const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(30);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        namespace,
        cluster,
        command,
    } = Args::parse();

    log_format
        .try_init(log_level)
        .map_err(|error| anyhow!("failed to configure logging: {error}"))?;

    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
    let store = ClusterDeclarations::new(client, &namespace, cluster.as_str());

    let command = command.into_command();
    debug!(%namespace, %cluster, %command, "Applying");
    let fencing = time::timeout(WRITE_TIMEOUT, command::execute(&store, &command))
        .await
        .map_err(|_| anyhow!("timed out updating {namespace}/{cluster}"))??;

    println!("{namespace}/{cluster}: fenced instances {fencing}");
    Ok(())
}

impl Cmd {
    fn into_command(self) -> Command {
        match self {
            Self::On { target } => Command::On(target),
            Self::Off { target } => Command::Off(target),
            Self::Set { fenced_instances } => Command::Replace(fenced_instances),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, clap::Error> {
        let args = ["pg-fence", "--cluster", "pg"].iter().chain(args);
        Args::try_parse_from(args).map(|args| args.command.into_command())
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse(&["on", "pg-1"]).unwrap(),
            Command::On(Target::Instance("pg-1".into()))
        );
        assert_eq!(parse(&["off", "*"]).unwrap(), Command::Off(Target::All));
        assert_eq!(
            parse(&["set", r#"["pg-2","pg-1"]"#]).unwrap(),
            Command::Replace(FencingSet::instances(["pg-1", "pg-2"]))
        );
        assert_eq!(
            parse(&["set", "[]"]).unwrap(),
            Command::Replace(FencingSet::none())
        );
    }

    #[test]
    fn rejects_invalid_arguments() {
        assert!(parse(&["on", ""]).is_err());
        assert!(parse(&["set", r#"["*","pg-1"]"#]).is_err());
        assert!(parse(&["set", "pg-1"]).is_err());
        assert!(Args::try_parse_from(["pg-fence", "on", "pg-1"]).is_err());
    }
}
