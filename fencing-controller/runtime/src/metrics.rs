use crate::core::{
    executor::{Execute, ExecutionError},
    InstanceId, Role,
};
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts fencing operations by action and outcome.
#[derive(Clone, Debug, Default)]
pub struct ExecutorMetrics {
    operations: Family<OperationLabels, Counter>,
}

/// Wraps an executor to record the outcome of every operation.
#[derive(Debug)]
pub struct MeteredExecutor<E> {
    inner: E,
    metrics: ExecutorMetrics,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OperationLabels {
    action: Action,
    role: RoleLabel,
    result: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum Action {
    Fence,
    Unfence,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum RoleLabel {
    Primary,
    Replica,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum Outcome {
    Success,
    Timeout,
    Unreachable,
    NotStreaming,
}

// === impl ExecutorMetrics ===

impl ExecutorMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let operations = Family::default();
        prom.register(
            "operations",
            "Count of fence and unfence operations by outcome",
            operations.clone(),
        );
        Self { operations }
    }

    fn record(&self, action: Action, role: Role, res: &Result<(), ExecutionError>) {
        let result = match res {
            Ok(()) => Outcome::Success,
            Err(ExecutionError::Timeout(_)) => Outcome::Timeout,
            Err(ExecutionError::Unreachable(_)) => Outcome::Unreachable,
            Err(ExecutionError::NotStreaming(_)) => Outcome::NotStreaming,
        };
        let role = match role {
            Role::Primary => RoleLabel::Primary,
            Role::Replica => RoleLabel::Replica,
        };
        self.operations
            .get_or_create(&OperationLabels {
                action,
                role,
                result,
            })
            .inc();
    }
}

// === impl MeteredExecutor ===

impl<E> MeteredExecutor<E> {
    pub fn new(inner: E, metrics: ExecutorMetrics) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait::async_trait]
impl<E: Execute> Execute for MeteredExecutor<E> {
    async fn fence(&self, instance: &InstanceId, role: Role) -> Result<(), ExecutionError> {
        let res = self.inner.fence(instance, role).await;
        self.metrics.record(Action::Fence, role, &res);
        res
    }

    async fn unfence(&self, instance: &InstanceId, role: Role) -> Result<(), ExecutionError> {
        let res = self.inner.unfence(instance, role).await;
        self.metrics.record(Action::Unfence, role, &res);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    struct Flaky;

    #[async_trait::async_trait]
    impl Execute for Flaky {
        async fn fence(&self, _: &InstanceId, _: Role) -> Result<(), ExecutionError> {
            Ok(())
        }

        async fn unfence(&self, _: &InstanceId, _: Role) -> Result<(), ExecutionError> {
            Err(ExecutionError::NotStreaming(0))
        }
    }

    #[tokio::test]
    async fn records_outcomes() {
        let mut prom = Registry::default();
        let metrics = ExecutorMetrics::register(&mut prom);
        let executor = MeteredExecutor::new(Flaky, metrics);

        let id = InstanceId::from("pg-1");
        executor.fence(&id, Role::Primary).await.unwrap();
        executor.fence(&id, Role::Primary).await.unwrap();
        executor.unfence(&id, Role::Replica).await.unwrap_err();

        let mut text = String::new();
        encode(&mut text, &prom).unwrap();
        assert!(
            text.contains(r#"operations_total{action="Fence",role="Primary",result="Success"} 2"#),
            "{text}"
        );
        assert!(
            text.contains(
                r#"operations_total{action="Unfence",role="Replica",result="NotStreaming"} 1"#
            ),
            "{text}"
        );
    }
}
