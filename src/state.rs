use crate::services::{InjectionController, ProcessRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct AppStateInner {
    pub registry: ProcessRegistry,
    pub controller: Arc<InjectionController>,
    pub cancel: CancellationToken,
}

pub type AppState = Arc<AppStateInner>;

pub fn new_state(
    registry: ProcessRegistry,
    controller: Arc<InjectionController>,
    cancel: CancellationToken,
) -> AppState {
    Arc::new(AppStateInner {
        registry,
        controller,
        cancel,
    })
}
