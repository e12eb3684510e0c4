//! Tracking of started services for bulk teardown

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::service::Service;

/// Ordered list of successfully started services.
///
/// Teardown walks it newest first, so services started later (which may
/// depend on earlier ones) go down before their dependencies.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<Vec<Arc<Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, service: Arc<Service>) {
        let mut services = self.services.lock().await;
        debug!(pid = ?service.pid(), position = services.len(), "Registering service");
        services.push(service);
    }

    pub async fn len(&self) -> usize {
        self.services.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.lock().await.is_empty()
    }

    /// Kill every registered service, most recently registered first.
    ///
    /// Services that already exited are skipped by [`Service::kill`]. The
    /// lock is held throughout so nothing registers mid-teardown.
    pub async fn kill_all(&self) {
        let services = self.services.lock().await;
        info!(count = services.len(), "Killing all services");
        for service in services.iter().rev() {
            service.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use tokio_util::sync::CancellationToken;

    async fn started(config: ServiceConfig) -> Arc<Service> {
        let service = Arc::new(Service::new(config));
        service.start(&CancellationToken::new()).await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_kill_all_handles_mixed_states() {
        let registry = ServiceRegistry::new();
        let exited = started(ServiceConfig::new("true")).await;
        exited.wait().await;
        let running = started(ServiceConfig::new("sleep").args(["30"])).await;
        let stopped = started(ServiceConfig::new("sleep").args(["30"])).await;
        stopped.stop().await;

        registry.register(Arc::clone(&exited)).await;
        registry.register(Arc::clone(&running)).await;
        registry.register(Arc::clone(&stopped)).await;
        assert_eq!(registry.len().await, 3);

        registry.kill_all().await;

        assert_eq!(exited.state(), Some(0));
        assert!(running.state().is_some());
        assert!(stopped.state().is_some());

        // Safe to repeat.
        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_kill_all_newest_first() {
        let registry = ServiceRegistry::new();
        let mut services = Vec::new();
        for _ in 0..3 {
            let service = started(ServiceConfig::new("sleep").args(["30"])).await;
            registry.register(Arc::clone(&service)).await;
            services.push(service);
        }

        let exits = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let waiters: Vec<_> = services
            .iter()
            .enumerate()
            .map(|(index, service)| {
                let service = Arc::clone(service);
                let exits = Arc::clone(&exits);
                tokio::spawn(async move {
                    service.wait().await;
                    exits.lock().push(index);
                })
            })
            .collect();

        registry.kill_all().await;
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(*exits.lock(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = ServiceRegistry::new();
        assert!(registry.is_empty().await);
        registry.kill_all().await;
    }
}
