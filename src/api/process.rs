use actix_web::{web, HttpResponse, Responder};

use crate::state::AppState;

pub async fn list_processes(data: web::Data<AppState>) -> impl Responder {
    let mut list: Vec<_> = data
        .registry
        .snapshot()
        .into_iter()
        .map(|(_, record)| record)
        .collect();
    list.sort_by_key(|r| r.pid);

    HttpResponse::Ok().json(list)
}

/// 对已记录的进程手动触发一次决策（不会重复 attach）
pub async fn reevaluate_process(
    data: web::Data<AppState>,
    path: web::Path<i32>,
) -> impl Responder {
    let pid = path.into_inner();

    match data.controller.reevaluate(pid, &data.cancel).await {
        Some(record) => {
            log::info!("[api] re-evaluated pid {}: {}", pid, record.injection_status);
            HttpResponse::Ok().json(record)
        }
        None => HttpResponse::NotFound().json(serde_json::json!({
            "status": "error",
            "message": format!("Process {} is not monitored", pid)
        })),
    }
}
