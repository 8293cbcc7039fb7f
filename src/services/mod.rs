pub mod controller;
pub mod instrumentation;
pub mod nacos;
pub mod pipeline;
pub mod process_checker;
pub mod registry;
pub mod reporter;
pub mod restart;
pub mod scheduler;
pub mod watch;

#[cfg(test)]
pub mod testing;

pub use controller::InjectionController;
pub use instrumentation::LauncherInstrumentation;
pub use process_checker::SysinfoProbe;
pub use registry::ProcessRegistry;
pub use restart::RestartHandle;
pub use watch::Watch;
