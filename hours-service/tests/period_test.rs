//! Billing period advance integration tests for hours-service.

mod common;

use common::{with_tenant, TestApp, TEST_TENANT_ID};
use hours_service::config::HoursPolicyConfig;
use hours_service::grpc::proto::*;

fn advance(subscription_id: &str) -> AdvancePeriodRequest {
    AdvancePeriodRequest {
        subscription_id: subscription_id.to_string(),
    }
}

fn submit(project_id: &str, hours: &str) -> SubmitChangeRequestRequest {
    SubmitChangeRequestRequest {
        project_id: project_id.to_string(),
        estimated_hours: hours.to_string(),
        idempotency_key: String::new(),
        description: String::new(),
    }
}

#[tokio::test]
async fn unused_hours_roll_over_and_counters_reset() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let (project_id, subscription) = app.active_plan(Enforcement::QuotaAndHours, "10", 2).await;
    let project_id = project_id.to_string();

    for _ in 0..2 {
        client
            .submit_change_request(with_tenant(TEST_TENANT_ID, submit(&project_id, "3")))
            .await
            .unwrap();
    }

    let advanced = client
        .advance_period(with_tenant(
            TEST_TENANT_ID,
            advance(&subscription.subscription_id),
        ))
        .await
        .unwrap()
        .into_inner();

    let next = advanced.subscription.unwrap();
    assert_eq!(next.current_period_start, "2026-02-15");
    assert_eq!(next.current_period_end, "2026-03-15");
    assert_eq!(next.monthly_used_hours, "0");
    assert_eq!(next.change_requests_used, 0);

    let transaction = advanced.transaction.unwrap();
    assert_eq!(transaction.kind, TransactionKind::PeriodAdvance as i32);
    assert_eq!(transaction.rollover_delta, "4");
    assert_eq!(transaction.monthly_used_delta, "-6");
    assert_eq!(transaction.change_requests_delta, -2);

    let balance = advanced.balance.unwrap();
    assert_eq!(balance.monthly_remaining, "10");
    assert_eq!(balance.rollover_total, "4");
    assert_eq!(balance.total_available, "14");

    // Quota is available again
    let response = client
        .submit_change_request(with_tenant(TEST_TENANT_ID, submit(&project_id, "1")))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.decision, Decision::Accepted as i32);
}

#[tokio::test]
async fn rollover_is_capped_by_policy() {
    let app = TestApp::spawn_with_policy(HoursPolicyConfig {
        rollover_cap_hours: Some("6".parse().unwrap()),
        default_change_requests: 5,
    })
    .await;
    let mut client = app.grpc_client().await;
    let (_, subscription) = app.active_plan(Enforcement::Hours, "4", 5).await;

    let mut rollovers = Vec::new();
    for _ in 0..3 {
        let advanced = client
            .advance_period(with_tenant(
                TEST_TENANT_ID,
                advance(&subscription.subscription_id),
            ))
            .await
            .unwrap()
            .into_inner();
        rollovers.push(advanced.balance.unwrap().rollover_total);
    }

    assert_eq!(rollovers, vec!["4", "6", "6"]);
}

#[tokio::test]
async fn only_active_plans_advance() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let (_, subscription) = app.active_plan(Enforcement::Hours, "4", 5).await;

    client
        .cancel_subscription(with_tenant(
            TEST_TENANT_ID,
            CancelSubscriptionRequest {
                subscription_id: subscription.subscription_id.clone(),
                reason: String::new(),
            },
        ))
        .await
        .unwrap();

    let status = client
        .advance_period(with_tenant(
            TEST_TENANT_ID,
            advance(&subscription.subscription_id),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}
