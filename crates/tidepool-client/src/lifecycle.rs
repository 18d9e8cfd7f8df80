//! Ordered start and stop of the client's collaborators

use std::sync::Arc;
use tidepool_common::{Error, Result};
use tracing::{error, info};

/// A collaborator with a start/stop lifecycle
pub trait Service: Send + Sync {
    /// Name used in logs and shutdown errors
    fn name(&self) -> &str;

    fn start(&self) -> Result<()>;

    /// Release resources; called once per successful `start`
    fn stop(&self) -> Result<()>;
}

/// Services started in registration order and stopped in reverse
#[derive(Default)]
pub struct ServiceSet {
    services: Vec<Arc<dyn Service>>,
}

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Start every service
    ///
    /// If one fails, the services already started are stopped again and
    /// the start failure is returned.
    pub fn start_all(&self) -> Result<()> {
        for (index, service) in self.services.iter().enumerate() {
            if let Err(e) = service.start() {
                error!("Failed to start {}: {}", service.name(), e);
                for started in self.services[..index].iter().rev() {
                    if let Err(stop_error) = started.stop() {
                        error!("Failed to stop {}: {}", started.name(), stop_error);
                    }
                }
                return Err(e);
            }
            info!("Started {}", service.name());
        }
        Ok(())
    }

    /// Stop every service in reverse order, attempting all of them
    ///
    /// Failures are collected; the first one is reported as
    /// `Error::Shutdown` along with how many services failed.
    pub fn stop_all(&self) -> Result<()> {
        let mut failures: Vec<(String, Error)> = Vec::new();
        for service in self.services.iter().rev() {
            match service.stop() {
                Ok(()) => info!("Stopped {}", service.name()),
                Err(e) => {
                    error!("Failed to stop {}: {}", service.name(), e);
                    failures.push((service.name().to_string(), e));
                }
            }
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some((service, source)) => Err(Error::Shutdown {
                service,
                failed,
                source: Box::new(source),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
        fail_stop: bool,
    }

    impl Service for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(Error::internal("start failed"));
            }
            self.log.lock().push(format!("start {}", self.name));
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.log.lock().push(format!("stop {}", self.name));
            if self.fail_stop {
                return Err(Error::storage("stop failed"));
            }
            Ok(())
        }
    }

    fn set(specs: &[(&'static str, bool, bool)], log: &Arc<Mutex<Vec<String>>>) -> ServiceSet {
        let mut services = ServiceSet::new();
        for &(name, fail_start, fail_stop) in specs {
            services.add(Arc::new(Recorder {
                name,
                log: Arc::clone(log),
                fail_start,
                fail_stop,
            }));
        }
        services
    }

    #[test]
    fn test_stop_runs_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let services = set(&[("a", false, false), ("b", false, false)], &log);
        services.start_all().unwrap();
        services.stop_all().unwrap();
        assert_eq!(*log.lock(), vec!["start a", "start b", "stop b", "stop a"]);
    }

    #[test]
    fn test_stop_attempts_all_and_reports_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let services = set(
            &[("a", false, true), ("b", false, false), ("c", false, true)],
            &log,
        );
        let err = services.stop_all().unwrap_err();
        assert_eq!(*log.lock(), vec!["stop c", "stop b", "stop a"]);
        match err {
            Error::Shutdown {
                service, failed, ..
            } => {
                assert_eq!(service, "c");
                assert_eq!(failed, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_failed_start_unwinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let services = set(&[("a", false, false), ("b", true, false)], &log);
        assert!(services.start_all().is_err());
        assert_eq!(*log.lock(), vec!["start a", "stop a"]);
    }
}
