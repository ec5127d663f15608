#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use pharmacy_checkout::{
    auth::{Identity, USER_ID_HEADER, USER_ROLE_HEADER},
    build_router,
    config::{AppConfig, FulfillmentPolicy},
    db::{self, DbConfig},
    entities::{
        cart_item,
        coupon::{self, DiscountType},
        medicine, order, payment, reconciliation_issue, shipping_method, tax_rate,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    handlers::AppServices,
    services::{
        checkout::{CheckoutRequest, ShippingAddress},
        gateway::{
            CreateSourceRequest, GatewayOutcome, GatewaySource, GatewaySourceState,
            GatewaySourceStatus, PaymentGateway,
        },
        pricing::LineItemInput,
    },
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tower::ServiceExt;
use uuid::Uuid;

/// Handles for holding a `retrieve_source` call open mid-flight.
#[derive(Clone, Default)]
pub struct RetrievePause {
    pub entered: Arc<Notify>,
    pub resume: Arc<Notify>,
}

/// In-memory stand-in for the e-wallet gateway.
#[derive(Default)]
pub struct MockGateway {
    sources: Mutex<HashMap<String, GatewaySourceState>>,
    next_id: AtomicUsize,
    fail_create: AtomicBool,
    hold_capture: AtomicBool,
    captures: AtomicUsize,
    reuse_source: Mutex<Option<String>>,
    pause: Mutex<Option<RetrievePause>>,
}

impl MockGateway {
    /// Captures report `pending` instead of settling.
    pub fn hold_captures(&self, hold: bool) {
        self.hold_capture.store(hold, Ordering::SeqCst);
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// The next created source reuses an existing source id.
    pub fn reuse_source_id(&self, source_id: &str) {
        *self.reuse_source.lock().unwrap() = Some(source_id.to_string());
    }

    /// The next `retrieve_source` signals `entered` and waits for `resume`.
    pub fn pause_next_retrieve(&self) -> RetrievePause {
        let pause = RetrievePause::default();
        *self.pause.lock().unwrap() = Some(pause.clone());
        pause
    }

    pub fn fail_next_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_status(&self, source_id: &str, status: GatewaySourceStatus) {
        if let Some(state) = self.sources.lock().unwrap().get_mut(source_id) {
            state.status = status;
        }
    }

    pub fn set_amount(&self, source_id: &str, amount: Decimal) {
        if let Some(state) = self.sources.lock().unwrap().get_mut(source_id) {
            state.amount = amount;
        }
    }

    pub fn created(&self) -> usize {
        self.sources.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_source(
        &self,
        request: &CreateSourceRequest,
    ) -> Result<GatewaySource, ServiceError> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::ExternalServiceError(
                "gateway responded with 503".into(),
            ));
        }
        if let Some(source_id) = self.reuse_source.lock().unwrap().take() {
            return Ok(GatewaySource {
                checkout_url: format!("https://pay.test/checkout/{}", source_id),
                source_id,
                status: GatewaySourceStatus::Pending,
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let source_id = format!("src_test_{}", n);
        self.sources.lock().unwrap().insert(
            source_id.clone(),
            GatewaySourceState {
                source_id: source_id.clone(),
                status: GatewaySourceStatus::Pending,
                amount: request.amount,
                currency: request.currency.clone(),
            },
        );
        Ok(GatewaySource {
            checkout_url: format!("https://pay.test/checkout/{}", source_id),
            source_id,
            status: GatewaySourceStatus::Pending,
        })
    }

    async fn retrieve_source(&self, source_id: &str) -> Result<GatewaySourceState, ServiceError> {
        let pause = self.pause.lock().unwrap().take();
        if let Some(pause) = pause {
            pause.entered.notify_one();
            pause.resume.notified().await;
        }
        self.sources
            .lock()
            .unwrap()
            .get(source_id)
            .cloned()
            .ok_or_else(|| ServiceError::ExternalServiceError(format!("unknown source {}", source_id)))
    }

    async fn capture_source(
        &self,
        source: &GatewaySourceState,
    ) -> Result<Option<GatewayOutcome>, ServiceError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let mut sources = self.sources.lock().unwrap();
        let state = sources.get_mut(&source.source_id).ok_or_else(|| {
            ServiceError::ExternalServiceError(format!("unknown source {}", source.source_id))
        })?;
        if state.status != GatewaySourceStatus::Chargeable {
            return Err(ServiceError::ExternalServiceError(
                "gateway responded with 400 Bad Request".into(),
            ));
        }
        state.status = GatewaySourceStatus::Consumed;
        if self.hold_capture.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(GatewayOutcome::Paid))
    }
}

/// Services wired to a fresh in-memory SQLite database.
pub struct TestContext {
    pub db: Arc<DatabaseConnection>,
    pub gateway: Arc<MockGateway>,
    pub services: AppServices,
    pub config: AppConfig,
    events: Mutex<mpsc::Receiver<Event>>,
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "127.0.0.1".to_string(),
        0,
        "test".to_string(),
    );
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_policy(policy: FulfillmentPolicy) -> Self {
        let mut cfg = test_config();
        cfg.fulfillment_policy = policy;
        Self::with_config(cfg).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        // One connection: every pooled connection to `sqlite::memory:` is its own database.
        let pool = db::establish_connection_with_config(&DbConfig {
            url: config.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("in-memory sqlite");
        db::run_migrations(&pool).await.expect("migrations");

        let db = Arc::new(pool);
        let gateway = Arc::new(MockGateway::default());
        let (tx, rx) = mpsc::channel(1024);
        let gateway_dyn: Arc<dyn PaymentGateway> = gateway.clone();
        let services = AppServices::new(db.clone(), gateway_dyn, EventSender::new(tx), &config);

        Self {
            db,
            gateway,
            services,
            config,
            events: Mutex::new(rx),
        }
    }

    pub fn router(&self) -> Router {
        build_router(AppState {
            db: self.db.clone(),
            config: Arc::new(self.config.clone()),
            services: self.services.clone(),
        })
    }

    /// Events emitted since the last call.
    pub fn drain_events(&self) -> Vec<Event> {
        let mut rx = self.events.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    // ---- seeding ----

    pub async fn seed_medicine(&self, name: &str, price: Decimal, stock: i32) -> Uuid {
        self.seed_medicine_with(name, price, stock, false).await
    }

    pub async fn seed_medicine_with(
        &self,
        name: &str,
        price: Decimal,
        stock: i32,
        tax_exempt: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();
        medicine::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            price: Set(price),
            stock_quantity: Set(stock),
            is_tax_exempt: Set(tax_exempt),
            is_active: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("seed medicine");
        id
    }

    pub async fn seed_shipping(&self, cost: Decimal) -> Uuid {
        let id = Uuid::new_v4();
        shipping_method::ActiveModel {
            id: Set(id),
            name: Set("Standard".to_string()),
            base_cost: Set(cost),
            estimated_days: Set(Some(3)),
            is_active: Set(true),
        }
        .insert(&*self.db)
        .await
        .expect("seed shipping method");
        id
    }

    pub async fn seed_tax_rate(&self, country: &str, state: Option<&str>, rate: Decimal) {
        tax_rate::ActiveModel {
            id: Set(Uuid::new_v4()),
            country: Set(country.to_string()),
            state: Set(state.map(str::to_string)),
            rate: Set(rate),
            is_active: Set(true),
        }
        .insert(&*self.db)
        .await
        .expect("seed tax rate");
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        usage_limit: Option<i32>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        coupon::ActiveModel {
            id: Set(id),
            code: Set(coupon::normalize_code(code)),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            min_purchase_amount: Set(None),
            max_discount_amount: Set(None),
            valid_from: Set(Utc::now() - Duration::days(1)),
            valid_until: Set(Utc::now() + Duration::days(30)),
            usage_limit: Set(usage_limit),
            used_count: Set(0),
            is_active: Set(true),
        }
        .insert(&*self.db)
        .await
        .expect("seed coupon");
        id
    }

    pub async fn seed_cart_item(&self, user_id: Uuid, medicine_id: Uuid, quantity: i32) {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            medicine_id: Set(medicine_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed cart item");
    }

    /// The worked example catalog: one 50.00 medicine, 60.00 shipping,
    /// 12% PH tax, coupon SAVE10 for 10% off.
    pub async fn seed_worked_example(&self, stock: i32) -> Catalog {
        let medicine_id = self.seed_medicine("Paracetamol 500mg x20", Decimal::new(5000, 2), stock).await;
        let shipping_id = self.seed_shipping(Decimal::new(6000, 2)).await;
        self.seed_tax_rate("PH", None, Decimal::new(12, 0)).await;
        let coupon_id = self
            .seed_coupon("SAVE10", DiscountType::Percentage, Decimal::new(10, 0), None)
            .await;
        Catalog {
            medicine_id,
            shipping_id,
            coupon_id,
        }
    }

    // ---- reads ----

    pub async fn stock_of(&self, medicine_id: Uuid) -> i32 {
        medicine::Entity::find_by_id(medicine_id)
            .one(&*self.db)
            .await
            .unwrap()
            .expect("medicine exists")
            .stock_quantity
    }

    pub async fn order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .unwrap()
            .expect("order exists")
    }

    pub async fn payments_for(&self, order_id: Uuid) -> Vec<payment::Model> {
        payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await
            .unwrap()
    }

    pub async fn coupon_used_count(&self, coupon_id: Uuid) -> i32 {
        coupon::Entity::find_by_id(coupon_id)
            .one(&*self.db)
            .await
            .unwrap()
            .expect("coupon exists")
            .used_count
    }

    pub async fn cart_size(&self, user_id: Uuid) -> usize {
        cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .all(&*self.db)
            .await
            .unwrap()
            .len()
    }

    pub async fn issues(&self) -> Vec<reconciliation_issue::Model> {
        reconciliation_issue::Entity::find()
            .all(&*self.db)
            .await
            .unwrap()
    }

    pub async fn order_count(&self) -> usize {
        order::Entity::find().all(&*self.db).await.unwrap().len()
    }
}

pub struct Catalog {
    pub medicine_id: Uuid,
    pub shipping_id: Uuid,
    pub coupon_id: Uuid,
}

pub fn address() -> ShippingAddress {
    ShippingAddress {
        recipient_name: "Maria Santos".to_string(),
        line1: "88 Ayala Avenue".to_string(),
        line2: None,
        city: "Makati".to_string(),
        state: Some("Metro Manila".to_string()),
        postal_code: Some("1226".to_string()),
        country: "PH".to_string(),
        phone: Some("+639171234567".to_string()),
    }
}

pub fn checkout_request(
    items: &[(Uuid, i32)],
    shipping_method_id: Uuid,
    coupon_code: Option<&str>,
) -> CheckoutRequest {
    CheckoutRequest {
        items: items
            .iter()
            .map(|(medicine_id, quantity)| LineItemInput {
                medicine_id: *medicine_id,
                quantity: *quantity,
            })
            .collect(),
        shipping_method_id,
        shipping_address: address(),
        coupon_code: coupon_code.map(str::to_string),
    }
}

pub fn customer() -> Identity {
    Identity::customer(Uuid::new_v4())
}

pub fn admin() -> Identity {
    Identity::admin(Uuid::new_v4())
}

// ---- HTTP helpers ----

pub async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    identity: Option<&Identity>,
    body: Option<Value>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(identity) = identity {
        builder = builder
            .header(USER_ID_HEADER, identity.user_id.to_string())
            .header(USER_ROLE_HEADER, identity.role.to_string());
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    router.clone().oneshot(request).await.unwrap()
}

pub async fn send_raw(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn assert_status(response: &Response, expected: StatusCode) {
    assert_eq!(response.status(), expected, "unexpected status");
}
