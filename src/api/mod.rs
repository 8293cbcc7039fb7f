pub mod metrics;
pub mod process;

pub use metrics::get_metrics;
pub use process::{list_processes, reevaluate_process};

use actix_web::{HttpResponse, Responder};

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy"
    }))
}
