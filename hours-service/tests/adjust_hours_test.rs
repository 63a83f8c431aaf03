//! Hours adjustment and journal integration tests for hours-service.

mod common;

use common::{with_tenant, TestApp, TEST_TENANT_ID};
use hours_service::grpc::proto::*;
use uuid::Uuid;

fn adjust(project_id: Uuid, bucket: HoursBucket, delta: &str, key: &str) -> AdjustHoursRequest {
    AdjustHoursRequest {
        project_id: project_id.to_string(),
        bucket: bucket as i32,
        delta: delta.to_string(),
        reason: "Purchased 10-hour pack".to_string(),
        idempotency_key: key.to_string(),
    }
}

#[tokio::test]
async fn grant_and_revoke_pack_hours() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let project_id = Uuid::new_v4();

    let granted = client
        .adjust_hours(with_tenant(
            TEST_TENANT_ID,
            adjust(project_id, HoursBucket::Pack, "10", ""),
        ))
        .await
        .unwrap()
        .into_inner();

    let transaction = granted.transaction.unwrap();
    assert_eq!(transaction.kind, TransactionKind::PackAdjustment as i32);
    assert_eq!(transaction.pack_delta, "10");
    assert_eq!(transaction.description, "Purchased 10-hour pack");
    // Pack hours exist without any plan
    assert_eq!(granted.balance.unwrap().pack_hours_total, "10");

    let revoked = client
        .adjust_hours(with_tenant(
            TEST_TENANT_ID,
            adjust(project_id, HoursBucket::Pack, "-2.25", ""),
        ))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(revoked.balance.unwrap().pack_hours_total, "7.75");

    let status = client
        .adjust_hours(with_tenant(
            TEST_TENANT_ID,
            adjust(project_id, HoursBucket::Pack, "-8", ""),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}

#[tokio::test]
async fn rollover_grant_adds_to_total() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let (project_id, _) = app.active_plan(Enforcement::Hours, "5", 5).await;

    let response = client
        .adjust_hours(with_tenant(
            TEST_TENANT_ID,
            adjust(project_id, HoursBucket::Rollover, "1.5", ""),
        ))
        .await
        .unwrap()
        .into_inner();

    let balance = response.balance.unwrap();
    assert_eq!(balance.rollover_total, "1.5");
    assert_eq!(balance.total_available, "6.5");
    assert_eq!(
        response.transaction.unwrap().kind,
        TransactionKind::RolloverAdjustment as i32
    );
}

#[tokio::test]
async fn invalid_adjustments_are_rejected() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let project_id = Uuid::new_v4();

    let zero = adjust(project_id, HoursBucket::Pack, "0", "");
    let garbage = adjust(project_id, HoursBucket::Pack, "ten", "");
    let mut no_bucket = adjust(project_id, HoursBucket::Pack, "1", "");
    no_bucket.bucket = HoursBucket::Unspecified as i32;

    let sub_precision = adjust(project_id, HoursBucket::Pack, "0.00001", "");
    let too_large = adjust(project_id, HoursBucket::Pack, "100000000", "");

    for request in [zero, garbage, no_bucket, sub_precision, too_large] {
        let status = client
            .adjust_hours(with_tenant(TEST_TENANT_ID, request))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}

#[tokio::test]
async fn grants_beyond_stored_range_are_rejected() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let project_id = Uuid::new_v4();

    client
        .adjust_hours(with_tenant(
            TEST_TENANT_ID,
            adjust(project_id, HoursBucket::Pack, "60000000", ""),
        ))
        .await
        .unwrap();

    let status = client
        .adjust_hours(with_tenant(
            TEST_TENANT_ID,
            adjust(project_id, HoursBucket::Pack, "60000000", ""),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

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
    assert_eq!(balance.pack_hours_total, "60000000");
}

#[tokio::test]
async fn repeated_grant_is_applied_once() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let project_id = Uuid::new_v4();

    let first = client
        .adjust_hours(with_tenant(
            TEST_TENANT_ID,
            adjust(project_id, HoursBucket::Pack, "10", "invoice-981"),
        ))
        .await
        .unwrap()
        .into_inner();
    let second = client
        .adjust_hours(with_tenant(
            TEST_TENANT_ID,
            adjust(project_id, HoursBucket::Pack, "10", "invoice-981"),
        ))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(
        first.transaction.unwrap().transaction_id,
        second.transaction.unwrap().transaction_id
    );
    assert_eq!(second.balance.unwrap().pack_hours_total, "10");

    // Same key for a different bucket is a conflict
    let status = client
        .adjust_hours(with_tenant(
            TEST_TENANT_ID,
            adjust(project_id, HoursBucket::Rollover, "10", "invoice-981"),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::AlreadyExists);
}

#[tokio::test]
async fn journal_pages_newest_first() {
    let app = TestApp::spawn().await;
    let mut client = app.grpc_client().await;
    let project_id = Uuid::new_v4();

    for delta in ["1", "2", "3", "4", "5"] {
        client
            .adjust_hours(with_tenant(
                TEST_TENANT_ID,
                adjust(project_id, HoursBucket::Pack, delta, ""),
            ))
            .await
            .unwrap();
    }

    let list = |page_token: String| ListHoursTransactionsRequest {
        project_id: project_id.to_string(),
        page_size: 2,
        page_token,
    };

    let mut deltas = Vec::new();
    let mut token = String::new();
    let mut pages = 0;
    loop {
        let page = client
            .list_hours_transactions(with_tenant(TEST_TENANT_ID, list(token)))
            .await
            .unwrap()
            .into_inner();
        pages += 1;
        deltas.extend(page.transactions.into_iter().map(|t| t.pack_delta));
        if page.next_page_token.is_empty() {
            break;
        }
        token = page.next_page_token;
    }

    assert_eq!(pages, 3);
    assert_eq!(deltas, vec!["5", "4", "3", "2", "1"]);

    let status = client
        .list_hours_transactions(with_tenant(
            TEST_TENANT_ID,
            list("not-a-token".to_string()),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}
