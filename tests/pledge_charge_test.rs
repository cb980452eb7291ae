//! Fundraiser pledge flows through the HTTP boundary.

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use bandstand::notify::{RecordingDispatcher, templates};
use bandstand::processor::{MockProcessorClient, StoredPaymentMethod};
use bandstand::storage::memory::InMemoryEngineStore;
use bandstand::storage::{Artist, PaymentStore, TrackGroup, UserAccount};
use bandstand::{CheckoutUrls, PaymentContext, SiteSettings};

struct Harness {
    app: Router,
    store: InMemoryEngineStore,
    processor: MockProcessorClient,
    mailer: RecordingDispatcher,
}

fn harness() -> Harness {
    let store = InMemoryEngineStore::new();
    let processor = MockProcessorClient::new();
    let mailer = RecordingDispatcher::new();
    let context = PaymentContext::new(
        store.clone(),
        processor.clone(),
        mailer.clone(),
        SiteSettings::new().webhook_secret("whsec_pledges"),
        CheckoutUrls::new("https://bandstand.test/thanks", "https://bandstand.test/cart"),
    );
    Harness {
        app: bandstand::http::router(context),
        store,
        processor,
        mailer,
    }
}

fn seed_fundraiser(h: &Harness) {
    h.store.insert_user(UserAccount {
        id: "u1".to_string(),
        email: "backer@example.com".to_string(),
        name: Some("Backer".to_string()),
        created_at: Utc::now(),
    });
    h.store.insert_artist(Artist {
        id: "a1".to_string(),
        name: "The Band".to_string(),
        contact_email: Some("band@example.com".to_string()),
        connected_account_id: Some("acct_band".to_string()),
        charges_enabled: true,
        fee_override_percent: None,
    });
    h.store.insert_track_group(TrackGroup {
        id: "tg_fund".to_string(),
        artist_id: "a1".to_string(),
        title: "Crowdfunded LP".to_string(),
        price: 2000,
        currency: "usd".to_string(),
        minimum_price: 1000,
        upstream_product_id: None,
        purchasable: false,
        fundraiser_id: Some("fund_1".to_string()),
        fundraiser_goal: Some(500_000),
    });
}

async fn request(app: &Router, method: Method, uri: &str, body: Option<&Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let body = match body {
        Some(value) => Body::from(serde_json::to_vec(value).unwrap()),
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_pledge_below_minimum_is_rejected() {
    let h = harness();
    seed_fundraiser(&h);

    let (status, _) = request(
        &h.app,
        Method::POST,
        "/pledges",
        Some(&json!({"userId": "u1", "trackGroupId": "tg_fund", "amount": 500})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_charge_run_settles_pledge_with_stored_method() {
    let h = harness();
    seed_fundraiser(&h);
    h.processor.insert_stored_payment_method(
        "acct_band",
        "backer@example.com",
        StoredPaymentMethod {
            id: "pm_1".to_string(),
            customer_id: "cus_1".to_string(),
        },
    );

    let (status, body) = request(
        &h.app,
        Method::POST,
        "/pledges",
        Some(&json!({"userId": "u1", "trackGroupId": "tg_fund", "amount": 2000})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let pledge_id = body["pledgeId"].as_str().unwrap().to_string();

    let (status, report) = request(&h.app, Method::POST, "/pledges/charge", Some(&json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["charged"], 1);
    assert_eq!(report["failed"], 0);

    let pledge = h.store.find_pledge(&pledge_id).await.unwrap().unwrap();
    assert!(pledge.paid_at.is_some());
    assert_eq!(pledge.stored_payment_method_ref.as_deref(), Some("pm_1"));

    // The backer got the release and one settlement email.
    assert_eq!(h.store.all_purchases().len(), 1);
    assert_eq!(
        h.mailer
            .queued_for_template(templates::FUNDRAISER_PLEDGE_CHARGED)
            .len(),
        1
    );
    assert_eq!(h.processor.off_session_charges().len(), 1);

    // A second run finds nothing left to charge.
    let (_, report) = request(&h.app, Method::POST, "/pledges/charge", Some(&json!({}))).await;
    assert_eq!(report["charged"], 0);
    assert_eq!(report["skipped"], 0);
    assert_eq!(h.processor.off_session_charges().len(), 1);
}

#[tokio::test]
async fn test_charge_run_skips_backers_without_stored_methods() {
    let h = harness();
    seed_fundraiser(&h);

    let (_, body) = request(
        &h.app,
        Method::POST,
        "/pledges",
        Some(&json!({"userId": "u1", "trackGroupId": "tg_fund", "amount": 2000})),
    )
    .await;
    let pledge_id = body["pledgeId"].as_str().unwrap().to_string();

    let (_, report) = request(
        &h.app,
        Method::POST,
        "/pledges/charge",
        Some(&json!({"fundraiserId": "fund_1"})),
    )
    .await;
    assert_eq!(report["skipped"], 1);
    assert_eq!(report["charged"], 0);

    // The pledge stays open for the next run.
    let pledge = h.store.find_pledge(&pledge_id).await.unwrap().unwrap();
    assert!(pledge.is_open());
    assert!(h.processor.off_session_charges().is_empty());
    assert!(h.mailer.queued().is_empty());
}

#[tokio::test]
async fn test_cancelled_pledge_is_never_charged() {
    let h = harness();
    seed_fundraiser(&h);
    h.processor.insert_stored_payment_method(
        "acct_band",
        "backer@example.com",
        StoredPaymentMethod {
            id: "pm_1".to_string(),
            customer_id: "cus_1".to_string(),
        },
    );

    let (_, body) = request(
        &h.app,
        Method::POST,
        "/pledges",
        Some(&json!({"userId": "u1", "trackGroupId": "tg_fund", "amount": 2000})),
    )
    .await;
    let pledge_id = body["pledgeId"].as_str().unwrap().to_string();

    let (status, _) = request(
        &h.app,
        Method::DELETE,
        &format!("/pledges/{}", pledge_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, report) = request(&h.app, Method::POST, "/pledges/charge", Some(&json!({}))).await;
    assert_eq!(report["charged"], 0);
    assert_eq!(report["skipped"], 0);
    assert!(h.processor.off_session_charges().is_empty());

    // Cancelling twice is a client error.
    let (status, _) = request(
        &h.app,
        Method::DELETE,
        &format!("/pledges/{}", pledge_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_charge_scope_cannot_mix_filters() {
    let h = harness();
    let (status, _) = request(
        &h.app,
        Method::POST,
        "/pledges/charge",
        Some(&json!({"fundraiserId": "fund_1", "trackGroupId": "tg_fund"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
