//! Validating admission webhook for RoutingFragment objects.
//!
//! Rejects structurally invalid fragments at write time so the
//! controller's quarantine path only has to cover objects that predate
//! the webhook or slipped past it.

use crate::crds::RoutingFragment;
use axum::{extract::Json, routing::post, Router};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub fn router() -> Router {
    Router::new().route("/validate", post(validate_handler))
}

pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Admission webhook listening");
    axum::serve(listener, router()).await?;
    Ok(())
}

async fn validate_handler(
    Json(review): Json<AdmissionReview<RoutingFragment>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<RoutingFragment> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Malformed admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review_fragment(&request).into_review())
}

fn review_fragment(request: &AdmissionRequest<RoutingFragment>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    // Deletions carry no object to validate.
    let Some(fragment) = &request.object else {
        return response;
    };
    match klaxon_core::validate::validate_fragment(&fragment.spec.policy) {
        Ok(()) => response,
        Err(e) => {
            warn!(
                name = %request.name,
                namespace = %request.namespace.as_deref().unwrap_or(""),
                error = %e,
                "Denying RoutingFragment"
            );
            response.deny(e.to_string())
        }
    }
}
