//! Device environment the scheduler paces itself against.
//!
//! The snapshot is owned by an [`EnvironmentHandle`] and published to the
//! scheduler over a `tokio::sync::watch` channel, so there is no global
//! "current environment" and tests can drive it directly.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Network connectivity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    /// Offline.
    None,
    /// Connected, but traffic costs money (cellular, tethering).
    Metered,
    #[default]
    Unmetered,
}

/// Device power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    #[default]
    Normal,
    Saver,
}

/// Snapshot of the conditions admission decisions depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerEnvironment {
    pub network_class: NetworkClass,
    pub power_state: PowerState,
}

impl SchedulerEnvironment {
    pub fn new(network_class: NetworkClass, power_state: PowerState) -> Self {
        Self {
            network_class,
            power_state,
        }
    }

    pub fn offline() -> Self {
        Self::new(NetworkClass::None, PowerState::Normal)
    }
}

impl fmt::Display for SchedulerEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.network_class, self.power_state)
    }
}

/// Writer side of the environment snapshot. Cheap to clone.
///
/// Platform glue (connectivity and battery listeners) calls [`set`] or
/// [`update`]; every change wakes the scheduler so deferred tasks are
/// reconsidered immediately.
///
/// [`set`]: EnvironmentHandle::set
/// [`update`]: EnvironmentHandle::update
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    sender: Arc<watch::Sender<SchedulerEnvironment>>,
}

impl EnvironmentHandle {
    pub fn new(initial: SchedulerEnvironment) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Current snapshot.
    pub fn current(&self) -> SchedulerEnvironment {
        *self.sender.borrow()
    }

    /// Replace the snapshot.
    pub fn set(&self, environment: SchedulerEnvironment) {
        self.sender.send_replace(environment);
    }

    /// Modify the snapshot in place.
    pub fn update(&self, f: impl FnOnce(&mut SchedulerEnvironment)) {
        self.sender.send_modify(f);
    }

    pub fn set_network(&self, network_class: NetworkClass) {
        self.update(|env| env.network_class = network_class);
    }

    pub fn set_power(&self, power_state: PowerState) {
        self.update(|env| env.power_state = power_state);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SchedulerEnvironment> {
        self.sender.subscribe()
    }
}

impl Default for EnvironmentHandle {
    fn default() -> Self {
        Self::new(SchedulerEnvironment::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_changes_reach_subscribers() {
        let handle = EnvironmentHandle::default();
        let mut rx = handle.subscribe();

        handle.set_network(NetworkClass::Metered);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().network_class, NetworkClass::Metered);

        let clone = handle.clone();
        clone.set_power(PowerState::Saver);
        assert_eq!(
            handle.current(),
            SchedulerEnvironment::new(NetworkClass::Metered, PowerState::Saver)
        );
    }

    #[test]
    fn test_serde_names() {
        let env: SchedulerEnvironment =
            serde_json::from_str(r#"{"networkClass":"none","powerState":"saver"}"#).unwrap();
        assert_eq!(env, SchedulerEnvironment::new(NetworkClass::None, PowerState::Saver));
    }
}
