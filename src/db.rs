use crate::config::AppConfig;
use crate::errors::ServiceError;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement,
};
use std::time::Duration;
use tracing::{debug, error, info};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Establishes a connection pool to the database
pub async fn establish_connection(database_url: &str) -> Result<DbPool, ServiceError> {
    let config = DbConfig {
        url: database_url.to_string(),
        ..Default::default()
    };

    establish_connection_with_config(&config).await
}

/// Establishes a connection pool to the database with custom configuration
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(true);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let db_pool = Database::connect(opt)
        .await
        .map_err(ServiceError::DatabaseError)?;

    info!("Database connection pool established successfully");

    Ok(db_pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    establish_connection_with_config(&db_cfg).await
}

/// Applies the embedded schema. Every statement is idempotent, so this is
/// safe to run on every startup.
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    info!("Applying database schema");
    let start = std::time::Instant::now();

    let backend = pool.get_database_backend();
    let schema = match backend {
        DbBackend::Postgres => SCHEMA_POSTGRES,
        DbBackend::Sqlite => SCHEMA_SQLITE,
        other => {
            return Err(ServiceError::InternalError(format!(
                "unsupported database backend: {:?}",
                other
            )))
        }
    };

    for sql in schema.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        pool.execute(Statement::from_string(backend, sql.to_string()))
            .await
            .map_err(|e| {
                error!("Schema statement failed: {}", e);
                ServiceError::DatabaseError(e)
            })?;
    }

    info!("Database schema applied in {:?}", start.elapsed());
    Ok(())
}

/// Checks if the database connection is active
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    debug!("Checking database connection");
    pool.ping().await.map_err(ServiceError::DatabaseError)
}

/// Closes the database connection pool
pub async fn close_pool(pool: DbPool) -> Result<(), ServiceError> {
    info!("Closing database connection pool");
    pool.close().await.map_err(ServiceError::DatabaseError)
}

const SCHEMA_POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id UUID PRIMARY KEY,
    order_number VARCHAR(32) NOT NULL UNIQUE,
    user_id UUID NOT NULL,
    status VARCHAR(20) NOT NULL,
    payment_status VARCHAR(20) NOT NULL,
    payment_method VARCHAR(64),
    payment_id VARCHAR(128),
    subtotal NUMERIC(19, 4) NOT NULL,
    tax NUMERIC(19, 4) NOT NULL,
    shipping NUMERIC(19, 4) NOT NULL,
    discount NUMERIC(19, 4) NOT NULL,
    total_amount NUMERIC(19, 4) NOT NULL,
    currency VARCHAR(3) NOT NULL,
    shipping_address JSONB NOT NULL,
    upstream_order_qid VARCHAR(64),
    upstream_order_payload JSONB,
    notes TEXT,
    admin_notes TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    accepted_at TIMESTAMPTZ,
    dispatched_at TIMESTAMPTZ,
    delivered_at TIMESTAMPTZ,
    cancelled_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_orders_user_id ON orders (user_id);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status);

CREATE TABLE IF NOT EXISTS order_items (
    id UUID PRIMARY KEY,
    order_id UUID NOT NULL REFERENCES orders (id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    gtin VARCHAR(32) NOT NULL,
    name VARCHAR(255) NOT NULL,
    image_url VARCHAR(512),
    brand VARCHAR(128),
    category VARCHAR(128),
    seller VARCHAR(128),
    quantity INTEGER NOT NULL,
    unit_price NUMERIC(19, 4) NOT NULL,
    subtotal NUMERIC(19, 4) NOT NULL,
    seller_data JSONB
);
CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items (order_id);

CREATE TABLE IF NOT EXISTS carts (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL UNIQUE,
    total_items INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS cart_items (
    id UUID PRIMARY KEY,
    cart_id UUID NOT NULL REFERENCES carts (id) ON DELETE CASCADE,
    gtin VARCHAR(32) NOT NULL,
    name VARCHAR(255) NOT NULL,
    image_url VARCHAR(512),
    brand VARCHAR(128),
    category VARCHAR(128),
    unit VARCHAR(32),
    quantity INTEGER NOT NULL,
    seller_offers JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cart_items_cart_id ON cart_items (cart_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_cart_items_cart_gtin ON cart_items (cart_id, gtin);

CREATE TABLE IF NOT EXISTS marketplace_tokens (
    id UUID PRIMARY KEY,
    access_token TEXT NOT NULL,
    access_expiry BIGINT NOT NULL,
    signature TEXT,
    account_info JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

const SCHEMA_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id BLOB PRIMARY KEY,
    order_number TEXT NOT NULL UNIQUE,
    user_id BLOB NOT NULL,
    status TEXT NOT NULL,
    payment_status TEXT NOT NULL,
    payment_method TEXT,
    payment_id TEXT,
    subtotal REAL NOT NULL,
    tax REAL NOT NULL,
    shipping REAL NOT NULL,
    discount REAL NOT NULL,
    total_amount REAL NOT NULL,
    currency TEXT NOT NULL,
    shipping_address TEXT NOT NULL,
    upstream_order_qid TEXT,
    upstream_order_payload TEXT,
    notes TEXT,
    admin_notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    accepted_at TEXT,
    dispatched_at TEXT,
    delivered_at TEXT,
    cancelled_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_orders_user_id ON orders (user_id);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status);

CREATE TABLE IF NOT EXISTS order_items (
    id BLOB PRIMARY KEY,
    order_id BLOB NOT NULL REFERENCES orders (id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    gtin TEXT NOT NULL,
    name TEXT NOT NULL,
    image_url TEXT,
    brand TEXT,
    category TEXT,
    seller TEXT,
    quantity INTEGER NOT NULL,
    unit_price REAL NOT NULL,
    subtotal REAL NOT NULL,
    seller_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items (order_id);

CREATE TABLE IF NOT EXISTS carts (
    id BLOB PRIMARY KEY,
    user_id BLOB NOT NULL UNIQUE,
    total_items INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cart_items (
    id BLOB PRIMARY KEY,
    cart_id BLOB NOT NULL REFERENCES carts (id) ON DELETE CASCADE,
    gtin TEXT NOT NULL,
    name TEXT NOT NULL,
    image_url TEXT,
    brand TEXT,
    category TEXT,
    unit TEXT,
    quantity INTEGER NOT NULL,
    seller_offers TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cart_items_cart_id ON cart_items (cart_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_cart_items_cart_gtin ON cart_items (cart_id, gtin);

CREATE TABLE IF NOT EXISTS marketplace_tokens (
    id BLOB PRIMARY KEY,
    access_token TEXT NOT NULL,
    access_expiry INTEGER NOT NULL,
    signature TEXT,
    account_info TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;
