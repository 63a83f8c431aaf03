//! HoursService gRPC implementation.

use crate::config::HoursPolicyConfig;
use crate::gate::can_access_dashboard;
use crate::grpc::proto::hours_service_server::HoursService;
use crate::grpc::proto::*;
use crate::models::AssignSubscription;
use crate::ledger::check_storable;
use crate::presentation::BalanceView;
use crate::services::{
    record_error, record_grpc_request, record_grpc_request_duration, AdjustHours, AdminService,
    ChangeRequestService, HoursStore, SubmitChangeRequest,
};
use chrono::{NaiveDate, Utc};
use prost_types::Timestamp;
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::grpc::extract_tenant_id;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};
use uuid::Uuid;

/// HoursService implementation.
pub struct HoursServiceImpl {
    change_requests: ChangeRequestService,
    admin: AdminService,
}

impl HoursServiceImpl {
    pub fn new(store: Arc<dyn HoursStore>, policy: HoursPolicyConfig) -> Self {
        Self {
            change_requests: ChangeRequestService::new(store.clone()),
            admin: AdminService::new(store, policy),
        }
    }
}

/// Record the outcome of one RPC and turn it into a tonic result.
#[allow(clippy::result_large_err)]
fn finish<T>(method: &str, start: Instant, result: Result<T, AppError>) -> Result<Response<T>, Status> {
    let duration = start.elapsed().as_secs_f64();
    match result {
        Ok(body) => {
            record_grpc_request(method, "ok");
            record_grpc_request_duration(method, duration);
            Ok(Response::new(body))
        }
        Err(e) => {
            tracing::warn!(method = method, error = %e, "Request failed");
            record_error(error_type(&e), method);
            record_grpc_request(method, "error");
            record_grpc_request_duration(method, duration);
            Err(e.into())
        }
    }
}

fn error_type(err: &AppError) -> &'static str {
    match err {
        AppError::ValidationError(_) | AppError::BadRequest(_) => "invalid_argument",
        AppError::NotFound(_) => "not_found",
        AppError::Unauthorized(_) => "unauthenticated",
        AppError::Conflict(_) => "conflict",
        AppError::FailedPrecondition(_) => "failed_precondition",
        AppError::Aborted(_) => "aborted",
        AppError::DatabaseError(_) => "database",
        _ => "internal",
    }
}

// Helper functions for type conversions
fn parse_uuid(field: &str, s: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(s)
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid {}: {:?}", field, s)))
}

fn parse_hours(field: &'static str, s: &str) -> Result<Decimal, AppError> {
    let hours = Decimal::from_str(s.trim())
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid {}: {:?}", field, s)))?;
    check_storable(field, hours).map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;
    Ok(hours)
}

/// Empty means zero, e.g. a quota-only plan that never estimates hours.
fn parse_hours_or_zero(field: &'static str, s: &str) -> Result<Decimal, AppError> {
    if s.trim().is_empty() {
        Ok(Decimal::ZERO)
    } else {
        parse_hours(field, s)
    }
}

fn parse_date(field: &str, s: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid {}: {:?}", field, s)))
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn hours_to_string(hours: Decimal) -> String {
    hours.normalize().to_string()
}

fn datetime_to_timestamp(dt: chrono::DateTime<Utc>) -> Option<Timestamp> {
    Some(Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    })
}

fn balance_to_proto(b: &crate::ledger::HoursBalance) -> HoursBalance {
    let view = BalanceView::from(b);
    HoursBalance {
        monthly_included: hours_to_string(b.monthly_included),
        monthly_used: hours_to_string(b.monthly_used),
        monthly_remaining: hours_to_string(b.monthly_remaining),
        rollover_total: hours_to_string(b.rollover_total),
        pack_hours_total: hours_to_string(b.pack_hours_total),
        is_unlimited: b.is_unlimited(),
        total_available: b
            .total_available
            .hours()
            .map(hours_to_string)
            .unwrap_or_default(),
        total_available_display: view.total_available.clone(),
        display: Some(BalanceDisplay {
            monthly_included: view.monthly_included,
            monthly_used: view.monthly_used,
            monthly_remaining: view.monthly_remaining,
            rollover_total: view.rollover_total,
            pack_hours_total: view.pack_hours_total,
            total_available: view.total_available,
        }),
    }
}

fn subscription_to_proto(s: crate::models::Subscription) -> Subscription {
    Subscription {
        subscription_id: s.subscription_id.to_string(),
        tenant_id: s.tenant_id.to_string(),
        project_id: s.project_id.to_string(),
        plan_name: s.plan_name,
        status: s.status.to_proto(),
        enforcement: s.enforcement.to_proto(),
        monthly_included_hours: hours_to_string(s.monthly_included_hours),
        monthly_used_hours: hours_to_string(s.monthly_used_hours),
        is_unlimited: s.is_unlimited,
        change_requests_allowed: s.change_requests_allowed,
        change_requests_used: s.change_requests_used,
        current_period_start: s.current_period_start.to_string(),
        current_period_end: s.current_period_end.to_string(),
        created_at: datetime_to_timestamp(s.created_utc),
        updated_at: datetime_to_timestamp(s.updated_utc),
        cancelled_at: s.cancelled_utc.and_then(datetime_to_timestamp),
    }
}

fn transaction_to_proto(t: crate::models::HoursTransaction) -> HoursTransaction {
    HoursTransaction {
        transaction_id: t.transaction_id.to_string(),
        tenant_id: t.tenant_id.to_string(),
        project_id: t.project_id.to_string(),
        subscription_id: t
            .subscription_id
            .map(|id| id.to_string())
            .unwrap_or_default(),
        kind: t.kind.to_proto(),
        monthly_used_delta: hours_to_string(t.monthly_used_delta),
        rollover_delta: hours_to_string(t.rollover_delta),
        pack_delta: hours_to_string(t.pack_delta),
        change_requests_delta: t.change_requests_delta,
        idempotency_key: t.idempotency_key.unwrap_or_default(),
        description: t.description.unwrap_or_default(),
        created_at: datetime_to_timestamp(t.created_utc),
    }
}

#[tonic::async_trait]
impl HoursService for HoursServiceImpl {
    // =========================================================================
    // Balance and admission
    // =========================================================================

    async fn get_balance(
        &self,
        request: Request<GetBalanceRequest>,
    ) -> Result<Response<GetBalanceResponse>, Status> {
        let start = Instant::now();
        let method = "GetBalance";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let project_id = parse_uuid("project_id", &req.project_id)?;

            let (balance, subscription) =
                self.change_requests.balance(tenant_id, project_id).await?;

            Ok::<_, AppError>(GetBalanceResponse {
                balance: Some(balance_to_proto(&balance)),
                subscription: subscription.map(subscription_to_proto),
            })
        }
        .await;

        finish(method, start, result)
    }

    async fn evaluate_change_request(
        &self,
        request: Request<EvaluateChangeRequestRequest>,
    ) -> Result<Response<EvaluateChangeRequestResponse>, Status> {
        let start = Instant::now();
        let method = "EvaluateChangeRequest";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let project_id = parse_uuid("project_id", &req.project_id)?;
            let estimated_hours = parse_hours_or_zero("estimated_hours", &req.estimated_hours)?;

            let evaluation = self
                .change_requests
                .evaluate(tenant_id, project_id, estimated_hours)
                .await?;

            Ok::<_, AppError>(EvaluateChangeRequestResponse {
                decision: evaluation.decision.to_proto(),
                message: evaluation.decision.user_message().to_string(),
                balance: Some(balance_to_proto(&evaluation.balance)),
            })
        }
        .await;

        finish(method, start, result)
    }

    async fn submit_change_request(
        &self,
        request: Request<SubmitChangeRequestRequest>,
    ) -> Result<Response<SubmitChangeRequestResponse>, Status> {
        let start = Instant::now();
        let method = "SubmitChangeRequest";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let project_id = parse_uuid("project_id", &req.project_id)?;

            tracing::info!(
                tenant_id = %tenant_id,
                project_id = %project_id,
                estimated_hours = %req.estimated_hours,
                "Submitting change request"
            );

            let submission = self
                .change_requests
                .submit(SubmitChangeRequest {
                    tenant_id,
                    project_id,
                    estimated_hours: parse_hours_or_zero(
                        "estimated_hours",
                        &req.estimated_hours,
                    )?,
                    idempotency_key: non_empty(req.idempotency_key),
                    description: non_empty(req.description),
                })
                .await?;

            Ok::<_, AppError>(SubmitChangeRequestResponse {
                decision: submission.decision.to_proto(),
                message: submission.decision.user_message().to_string(),
                balance: Some(balance_to_proto(&submission.balance)),
                transaction: submission.transaction.map(transaction_to_proto),
                replayed: submission.replayed,
            })
        }
        .await;

        finish(method, start, result)
    }

    async fn check_dashboard_access(
        &self,
        request: Request<CheckDashboardAccessRequest>,
    ) -> Result<Response<CheckDashboardAccessResponse>, Status> {
        let start = Instant::now();
        let method = "CheckDashboardAccess";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let project_id = parse_uuid("project_id", &req.project_id)?;

            let (_, subscription) = self.change_requests.balance(tenant_id, project_id).await?;

            Ok::<_, AppError>(CheckDashboardAccessResponse {
                allowed: can_access_dashboard(subscription.as_ref()),
            })
        }
        .await;

        finish(method, start, result)
    }

    // =========================================================================
    // Subscription administration
    // =========================================================================

    async fn assign_subscription(
        &self,
        request: Request<AssignSubscriptionRequest>,
    ) -> Result<Response<AssignSubscriptionResponse>, Status> {
        let start = Instant::now();
        let method = "AssignSubscription";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let project_id = parse_uuid("project_id", &req.project_id)?;

            let enforcement = crate::models::Enforcement::from_proto(req.enforcement)
                .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("enforcement is required")))?;

            tracing::info!(
                tenant_id = %tenant_id,
                project_id = %project_id,
                plan_name = %req.plan_name,
                "Assigning subscription"
            );

            let input = AssignSubscription {
                tenant_id,
                project_id,
                plan_name: req.plan_name,
                enforcement,
                monthly_included_hours: parse_hours_or_zero(
                    "monthly_included_hours",
                    &req.monthly_included_hours,
                )?,
                is_unlimited: req.is_unlimited,
                change_requests_allowed: if req.change_requests_allowed < 0 {
                    self.admin.policy().default_change_requests
                } else {
                    req.change_requests_allowed
                },
                period_start: if req.period_start.is_empty() {
                    Utc::now().date_naive()
                } else {
                    parse_date("period_start", &req.period_start)?
                },
                activate: req.activate,
            };

            let subscription = self.admin.assign(input).await?;

            Ok::<_, AppError>(AssignSubscriptionResponse {
                subscription: Some(subscription_to_proto(subscription)),
            })
        }
        .await;

        finish(method, start, result)
    }

    async fn activate_subscription(
        &self,
        request: Request<ActivateSubscriptionRequest>,
    ) -> Result<Response<ActivateSubscriptionResponse>, Status> {
        let start = Instant::now();
        let method = "ActivateSubscription";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let subscription_id = parse_uuid("subscription_id", &req.subscription_id)?;

            let subscription = self.admin.activate(tenant_id, subscription_id).await?;

            Ok::<_, AppError>(ActivateSubscriptionResponse {
                subscription: Some(subscription_to_proto(subscription)),
            })
        }
        .await;

        finish(method, start, result)
    }

    async fn cancel_subscription(
        &self,
        request: Request<CancelSubscriptionRequest>,
    ) -> Result<Response<CancelSubscriptionResponse>, Status> {
        let start = Instant::now();
        let method = "CancelSubscription";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let subscription_id = parse_uuid("subscription_id", &req.subscription_id)?;

            let subscription = self
                .admin
                .cancel(tenant_id, subscription_id, non_empty(req.reason))
                .await?;

            Ok::<_, AppError>(CancelSubscriptionResponse {
                subscription: Some(subscription_to_proto(subscription)),
            })
        }
        .await;

        finish(method, start, result)
    }

    async fn get_subscription(
        &self,
        request: Request<GetSubscriptionRequest>,
    ) -> Result<Response<GetSubscriptionResponse>, Status> {
        let start = Instant::now();
        let method = "GetSubscription";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let subscription_id = parse_uuid("subscription_id", &req.subscription_id)?;

            let subscription = self.admin.get_subscription(tenant_id, subscription_id).await?;

            Ok::<_, AppError>(GetSubscriptionResponse {
                subscription: Some(subscription_to_proto(subscription)),
            })
        }
        .await;

        finish(method, start, result)
    }

    async fn advance_period(
        &self,
        request: Request<AdvancePeriodRequest>,
    ) -> Result<Response<AdvancePeriodResponse>, Status> {
        let start = Instant::now();
        let method = "AdvancePeriod";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let subscription_id = parse_uuid("subscription_id", &req.subscription_id)?;

            let advanced = self.admin.advance_period(tenant_id, subscription_id).await?;

            Ok::<_, AppError>(AdvancePeriodResponse {
                balance: Some(balance_to_proto(&advanced.balance)),
                subscription: Some(subscription_to_proto(advanced.subscription)),
                transaction: Some(transaction_to_proto(advanced.transaction)),
            })
        }
        .await;

        finish(method, start, result)
    }

    // =========================================================================
    // Hours administration
    // =========================================================================

    async fn adjust_hours(
        &self,
        request: Request<AdjustHoursRequest>,
    ) -> Result<Response<AdjustHoursResponse>, Status> {
        let start = Instant::now();
        let method = "AdjustHours";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let project_id = parse_uuid("project_id", &req.project_id)?;

            let bucket = crate::services::HoursBucket::from_proto(req.bucket)
                .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("bucket is required")))?;

            tracing::info!(
                tenant_id = %tenant_id,
                project_id = %project_id,
                bucket = bucket.as_str(),
                delta = %req.delta,
                "Adjusting hours"
            );

            let (balance, transaction) = self
                .admin
                .adjust_hours(AdjustHours {
                    tenant_id,
                    project_id,
                    bucket,
                    delta: parse_hours("delta", &req.delta)?,
                    reason: non_empty(req.reason),
                    idempotency_key: non_empty(req.idempotency_key),
                })
                .await?;

            Ok::<_, AppError>(AdjustHoursResponse {
                balance: Some(balance_to_proto(&balance)),
                transaction: Some(transaction_to_proto(transaction)),
            })
        }
        .await;

        finish(method, start, result)
    }

    async fn list_hours_transactions(
        &self,
        request: Request<ListHoursTransactionsRequest>,
    ) -> Result<Response<ListHoursTransactionsResponse>, Status> {
        let start = Instant::now();
        let method = "ListHoursTransactions";

        let result = async move {
            let tenant_id = extract_tenant_id(&request)?;
            let req = request.into_inner();
            let project_id = parse_uuid("project_id", &req.project_id)?;

            let (transactions, next_page_token) = self
                .admin
                .list_transactions(
                    tenant_id,
                    project_id,
                    req.page_size,
                    Some(req.page_token.as_str()),
                )
                .await?;

            Ok::<_, AppError>(ListHoursTransactionsResponse {
                transactions: transactions.into_iter().map(transaction_to_proto).collect(),
                next_page_token: next_page_token.unwrap_or_default(),
            })
        }
        .await;

        finish(method, start, result)
    }
}
