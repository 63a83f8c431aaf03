//! Subscription lifecycle integration tests for hours-service.

mod common;

use common::{with_tenant, TestApp, TEST_TENANT_ID};
use hours_service::grpc::proto::*;
use uuid::Uuid;

fn assign(project_id: Uuid, activate: bool) -> AssignSubscriptionRequest {
    AssignSubscriptionRequest {
        project_id: project_id.to_string(),
        plan_name: "Premium Care".to_string(),
        enforcement: Enforcement::QuotaAndHours as i32,
        monthly_included_hours: "8".to_string(),
        is_unlimited: false,
        change_requests_allowed: -1,
        period_start: "2026-03-31".to_string(),
        activate,
    }
}

async fn dashboard_allowed(app: &TestApp, project_id: Uuid) -> bool {
    app.grpc_client()
        .await
        .check_dashboard_access(with_tenant(
            TEST_TENANT_ID,
            CheckDashboardAccessRequest {
                project_id: project_id.to_string(),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .allowed
}

#[tokio::test]
async fn inactive_then_active_then_cancelled() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let project_id = Uuid::new_v4();

    let subscription = client
        .assign_subscription(with_tenant(TEST_TENANT_ID, assign(project_id, false)))
        .await
        .unwrap()
        .into_inner()
        .subscription
        .unwrap();

    assert_eq!(subscription.status, SubscriptionStatus::Inactive as i32);
    // Unset quota falls back to the configured default
    assert_eq!(subscription.change_requests_allowed, 5);
    assert_eq!(subscription.current_period_start, "2026-03-31");
    assert_eq!(subscription.current_period_end, "2026-04-30");
    assert!(!dashboard_allowed(&app, project_id).await);

    let evaluation = client
        .evaluate_change_request(with_tenant(
            TEST_TENANT_ID,
            EvaluateChangeRequestRequest {
                project_id: project_id.to_string(),
                estimated_hours: "1".to_string(),
            },
        ))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        evaluation.decision,
        Decision::RejectedNoActiveSubscription as i32
    );

    let activated = client
        .activate_subscription(with_tenant(
            TEST_TENANT_ID,
            ActivateSubscriptionRequest {
                subscription_id: subscription.subscription_id.clone(),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .subscription
        .unwrap();
    assert_eq!(activated.status, SubscriptionStatus::Active as i32);
    assert!(dashboard_allowed(&app, project_id).await);

    let cancelled = client
        .cancel_subscription(with_tenant(
            TEST_TENANT_ID,
            CancelSubscriptionRequest {
                subscription_id: subscription.subscription_id.clone(),
                reason: "Client moved on".to_string(),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .subscription
        .unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled as i32);
    assert!(cancelled.cancelled_at.is_some());
    assert!(!dashboard_allowed(&app, project_id).await);

    let status = client
        .activate_subscription(with_tenant(
            TEST_TENANT_ID,
            ActivateSubscriptionRequest {
                subscription_id: subscription.subscription_id.clone(),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);

    let status = client
        .cancel_subscription(with_tenant(
            TEST_TENANT_ID,
            CancelSubscriptionRequest {
                subscription_id: subscription.subscription_id,
                reason: String::new(),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}

#[tokio::test]
async fn lifecycle_is_journaled() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let (project_id, subscription) = app.active_plan(Enforcement::Hours, "4", 3).await;

    client
        .cancel_subscription(with_tenant(
            TEST_TENANT_ID,
            CancelSubscriptionRequest {
                subscription_id: subscription.subscription_id.clone(),
                reason: "Project archived".to_string(),
            },
        ))
        .await
        .unwrap();

    let transactions = client
        .list_hours_transactions(with_tenant(
            TEST_TENANT_ID,
            ListHoursTransactionsRequest {
                project_id: project_id.to_string(),
                page_size: 0,
                page_token: String::new(),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .transactions;

    assert_eq!(transactions.len(), 2);
    assert!(transactions
        .iter()
        .all(|t| t.kind == TransactionKind::StatusChange as i32
            && t.subscription_id == subscription.subscription_id));
    assert_eq!(transactions[0].description, "Project archived");
    assert_eq!(transactions[1].description, "Assigned plan Standard Care");
}

#[tokio::test]
async fn second_active_plan_is_rejected() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let (project_id, _) = app.active_plan(Enforcement::Hours, "10", 5).await;

    let status = client
        .assign_subscription(with_tenant(TEST_TENANT_ID, assign(project_id, true)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::AlreadyExists);
}

#[tokio::test]
async fn activating_active_plan_is_idempotent() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let (_, subscription) = app.active_plan(Enforcement::Hours, "10", 5).await;

    let again = client
        .activate_subscription(with_tenant(
            TEST_TENANT_ID,
            ActivateSubscriptionRequest {
                subscription_id: subscription.subscription_id.clone(),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .subscription
        .unwrap();

    assert_eq!(again.status, SubscriptionStatus::Active as i32);
    assert_eq!(again.updated_at, subscription.updated_at);
}

#[tokio::test]
async fn get_subscription_works() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let (project_id, subscription) = app.active_plan(Enforcement::Quota, "0", 2).await;

    let fetched = client
        .get_subscription(with_tenant(
            TEST_TENANT_ID,
            GetSubscriptionRequest {
                subscription_id: subscription.subscription_id.clone(),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .subscription
        .unwrap();

    assert_eq!(fetched.project_id, project_id.to_string());
    assert_eq!(fetched.plan_name, "Standard Care");
    assert_eq!(fetched.enforcement, Enforcement::Quota as i32);
    assert_eq!(fetched.change_requests_allowed, 2);

    let status = client
        .get_subscription(with_tenant(
            TEST_TENANT_ID,
            GetSubscriptionRequest {
                subscription_id: Uuid::new_v4().to_string(),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn malformed_assignments_are_invalid() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;

    let mut missing_enforcement = assign(Uuid::new_v4(), true);
    missing_enforcement.enforcement = Enforcement::Unspecified as i32;

    let mut empty_name = assign(Uuid::new_v4(), true);
    empty_name.plan_name = String::new();

    let mut negative_hours = assign(Uuid::new_v4(), true);
    negative_hours.monthly_included_hours = "-3".to_string();

    let mut bad_date = assign(Uuid::new_v4(), true);
    bad_date.period_start = "31/03/2026".to_string();

    for request in [missing_enforcement, empty_name, negative_hours, bad_date] {
        let status = client
            .assign_subscription(with_tenant(TEST_TENANT_ID, request))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}

#[tokio::test]
async fn unlimited_plan_reports_unlimited_balance() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let project_id = Uuid::new_v4();

    let mut request = assign(project_id, true);
    request.is_unlimited = true;
    request.monthly_included_hours = String::new();
    client
        .assign_subscription(with_tenant(TEST_TENANT_ID, request))
        .await
        .unwrap();

    let balance = client
        .get_balance(with_tenant(
            TEST_TENANT_ID,
            GetBalanceRequest {
                project_id: project_id.to_string(),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .balance
        .unwrap();

    assert!(balance.is_unlimited);
    assert_eq!(balance.total_available, "");
    assert_eq!(balance.total_available_display, "∞");
}
