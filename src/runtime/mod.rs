pub mod docker;
pub mod executor;
pub mod lifecycle;
pub mod simulated;
pub mod traffic;

pub use docker::{DockerCli, Endpoint};
pub use executor::{CommandExecutor, CommandOutput, ExecError, ProcessExecutor};
pub use lifecycle::{KillReport, LifecycleError, LifecycleManager, Provisioned};
pub use simulated::SimulatedHost;
pub use traffic::{TrafficError, TrafficManager, TrafficRequest, TrafficSession};
