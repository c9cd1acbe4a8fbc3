//! End-to-end workflows across the command, query and event buses.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use switchyard::cqrs::IdempotencyConfig;
use switchyard::prelude::*;
use switchyard::resilience::Retry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    sku: String,
    price_cents: u64,
}

type Catalog = Arc<Mutex<HashMap<String, u64>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GetProduct {
    sku: String,
}

impl Message for GetProduct {
    type Result = Product;
}

impl Query for GetProduct {
    fn cache_ttl(&self) -> Option<Duration> {
        Some(Duration::from_secs(60))
    }
}

struct GetProductHandler {
    catalog: Catalog,
    reads: Arc<AtomicU32>,
}

#[async_trait]
impl QueryHandler<GetProduct> for GetProductHandler {
    async fn handle(&self, query: GetProduct, _ctx: &DispatchContext) -> Result<Product, HandlerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let price_cents = self
            .catalog
            .lock()
            .get(&query.sku)
            .copied()
            .ok_or_else(|| HandlerError::NotFound(query.sku.clone()))?;
        Ok(Product {
            sku: query.sku,
            price_cents,
        })
    }
}

#[derive(Debug, Clone)]
struct PriceChanged {
    metadata: EventMetadata,
    sku: String,
    price_cents: u64,
}

impl_event!(PriceChanged, metadata);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpdatePrice {
    request_id: String,
    sku: String,
    price_cents: u64,
}

impl Message for UpdatePrice {
    type Result = u64;
}

impl Command for UpdatePrice {
    fn idempotency_key(&self) -> Option<String> {
        Some(self.request_id.clone())
    }

    fn invalidates(&self) -> Vec<String> {
        vec![GetProduct::message_name().to_string()]
    }
}

struct UpdatePriceHandler {
    catalog: Catalog,
    writes: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler<UpdatePrice> for UpdatePriceHandler {
    async fn handle(&self, cmd: UpdatePrice, ctx: &DispatchContext) -> Result<u64, HandlerError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .catalog
            .lock()
            .insert(cmd.sku.clone(), cmd.price_cents)
            .ok_or_else(|| HandlerError::NotFound(cmd.sku.clone()))?;
        ctx.record_event(PriceChanged {
            metadata: EventMetadata::new("price_changed"),
            sku: cmd.sku,
            price_cents: cmd.price_cents,
        });
        Ok(previous)
    }
}

struct PriceLog(Arc<Mutex<Vec<(String, u64)>>>);

#[async_trait]
impl EventHandler<PriceChanged> for PriceLog {
    async fn handle(&self, event: &PriceChanged) -> Result<(), EventError> {
        self.0.lock().push((event.sku.clone(), event.price_cents));
        Ok(())
    }
}

struct Shop {
    commands: CommandBus,
    queries: QueryBus,
    reads: Arc<AtomicU32>,
    writes: Arc<AtomicU32>,
    price_log: Arc<Mutex<Vec<(String, u64)>>>,
}

fn shop() -> Shop {
    let catalog: Catalog = Arc::new(Mutex::new(HashMap::from([("widget".to_string(), 500)])));
    let cache = JitteredCache::in_memory(
        JitterConfig::default()
            .jitter_range(0.0, 0.0)
            .without_early_recompute(),
    )
    .unwrap();

    let events = EventBus::new();
    let price_log = Arc::new(Mutex::new(Vec::new()));
    events.subscribe::<PriceChanged, _>(PriceLog(Arc::clone(&price_log)));

    let store = Arc::new(IdempotencyStore::in_memory(IdempotencyConfig::default()));
    let commands = CommandBus::builder()
        .middleware(LoggingMiddleware::new())
        .middleware(ValidationMiddleware::new())
        .middleware(IdempotencyMiddleware::new(store))
        .event_bus(events)
        .invalidate_cache(cache.clone())
        .build();
    let queries = QueryBus::builder()
        .middleware(LoggingMiddleware::new())
        .cache(cache)
        .build();

    let reads = Arc::new(AtomicU32::new(0));
    let writes = Arc::new(AtomicU32::new(0));
    queries
        .register::<GetProduct, _>(GetProductHandler {
            catalog: Arc::clone(&catalog),
            reads: Arc::clone(&reads),
        })
        .unwrap();
    commands
        .register::<UpdatePrice, _>(UpdatePriceHandler {
            catalog,
            writes: Arc::clone(&writes),
        })
        .unwrap();

    Shop {
        commands,
        queries,
        reads,
        writes,
        price_log,
    }
}

fn widget() -> GetProduct {
    GetProduct {
        sku: "widget".to_string(),
    }
}

fn reprice(request_id: &str, price_cents: u64) -> UpdatePrice {
    UpdatePrice {
        request_id: request_id.to_string(),
        sku: "widget".to_string(),
        price_cents,
    }
}

#[tokio::test(start_paused = true)]
async fn test_cached_query_is_recomputed_after_ttl() {
    let shop = shop();

    let first = shop.queries.dispatch(widget()).await.unwrap();
    let second = shop.queries.dispatch(widget()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(shop.reads.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(61)).await;

    shop.queries.dispatch(widget()).await.unwrap();
    assert_eq!(shop.reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_price_update_invalidates_cached_product() {
    let shop = shop();
    assert_eq!(shop.queries.dispatch(widget()).await.unwrap().price_cents, 500);

    let previous = shop.commands.dispatch(reprice("req-1", 650)).await.unwrap();

    assert_eq!(previous, 500);
    assert_eq!(shop.queries.dispatch(widget()).await.unwrap().price_cents, 650);
    assert_eq!(shop.reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_successful_command_publishes_recorded_events() {
    let shop = shop();

    shop.commands.dispatch(reprice("req-1", 650)).await.unwrap();

    assert_eq!(*shop.price_log.lock(), vec![("widget".to_string(), 650)]);
}

#[tokio::test]
async fn test_failed_command_publishes_nothing() {
    let shop = shop();

    let result = shop
        .commands
        .dispatch(UpdatePrice {
            request_id: "req-1".into(),
            sku: "gadget".into(),
            price_cents: 100,
        })
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::Handler(HandlerError::NotFound(_)))
    ));
    assert!(shop.price_log.lock().is_empty());
}

#[tokio::test]
async fn test_duplicate_submission_replays_stored_result() {
    let shop = shop();

    let first = shop.commands.dispatch(reprice("req-1", 650)).await.unwrap();
    let replay = shop.commands.dispatch(reprice("req-1", 650)).await.unwrap();

    assert_eq!(first, replay);
    assert_eq!(shop.writes.load(Ordering::SeqCst), 1);
    assert_eq!(shop.price_log.lock().len(), 1);
}

#[tokio::test]
async fn test_reused_key_with_different_payload_is_rejected() {
    let shop = shop();
    shop.commands.dispatch(reprice("req-1", 650)).await.unwrap();

    let result = shop.commands.dispatch(reprice("req-1", 700)).await;

    assert!(matches!(
        result,
        Err(DispatchError::IdempotencyKeyConflict { ref key }) if key == "req-1"
    ));
    assert_eq!(shop.writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_registration_is_exclusive_per_message_type() {
    let shop = shop();

    let duplicate = shop.queries.register::<GetProduct, _>(GetProductHandler {
        catalog: Arc::new(Mutex::new(HashMap::new())),
        reads: Arc::new(AtomicU32::new(0)),
    });
    assert!(matches!(
        duplicate,
        Err(DispatchError::HandlerAlreadyRegistered { .. })
    ));

    let empty = QueryBus::new();
    let missing = empty.dispatch(widget()).await;
    assert!(matches!(
        missing,
        Err(DispatchError::HandlerNotFound { ref message_type }) if message_type == "GetProduct"
    ));
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncInventory;

impl Message for SyncInventory {
    type Result = ();
}

impl Command for SyncInventory {}

struct AlwaysBusy(Arc<AtomicU32>);

#[async_trait]
impl CommandHandler<SyncInventory> for AlwaysBusy {
    async fn handle(&self, _cmd: SyncInventory, _ctx: &DispatchContext) -> Result<(), HandlerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Transient("warehouse busy".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_configured_retry_policy_governs_the_pipeline() {
    let config = SwitchyardConfig::from_toml_str(
        r#"
        [retry]
        max_attempts = 2
        base_delay_ms = 10
        jitter = false
        "#,
    )
    .unwrap();
    config.validate().unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let bus = CommandBus::builder()
        .middleware(RetryMiddleware::new(Retry::new(config.retry.to_config())))
        .build();
    bus.register::<SyncInventory, _>(AlwaysBusy(Arc::clone(&calls)))
        .unwrap();

    let result = bus.dispatch(SyncInventory).await;

    assert!(matches!(
        result,
        Err(DispatchError::RetryExhausted { attempts: 2, .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
