pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Initialize `env_logger` once per process. `RUST_LOG` overrides the
/// default filter.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn")).init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::models::Address;
    use sqlx::PgPool;

    pub use database::{TestDatabase, TestDatabaseError};

    /// Row-level helpers for asserting on what an ingestion run left behind.
    pub struct TestFixtures<'a> {
        pool: &'a PgPool,
    }

    impl<'a> TestFixtures<'a> {
        /// Create a fixture helper bound to the provided pool.
        pub fn new(pool: &'a PgPool) -> Self {
            Self { pool }
        }

        /// Ids of every stored user, sorted.
        pub async fn user_ids(&self) -> Result<Vec<String>, sqlx::Error> {
            sqlx::query_scalar("SELECT id FROM users ORDER BY id")
                .fetch_all(self.pool)
                .await
        }

        /// Addresses stored for one user, in insertion order.
        pub async fn addresses_for(&self, user_id: &str) -> Result<Vec<Address>, sqlx::Error> {
            sqlx::query_as::<_, Address>(
                "SELECT street, city, state, zip_code, country, user_id FROM addresses WHERE user_id = $1 ORDER BY id",
            )
            .bind(user_id)
            .fetch_all(self.pool)
            .await
        }

        /// Every stored address as `(user_id, street)`, sorted.
        pub async fn address_pairs(&self) -> Result<Vec<(String, String)>, sqlx::Error> {
            sqlx::query_as("SELECT user_id, street FROM addresses ORDER BY user_id, street")
                .fetch_all(self.pool)
                .await
        }

        /// Total rows in `users` and `addresses`.
        pub async fn row_counts(&self) -> Result<(i64, i64), sqlx::Error> {
            sqlx::query_as(
                "SELECT (SELECT COUNT(*) FROM users), (SELECT COUNT(*) FROM addresses)",
            )
            .fetch_one(self.pool)
            .await
        }

        /// Empty both tables between runs.
        pub async fn truncate(&self) -> Result<(), sqlx::Error> {
            sqlx::query("TRUNCATE addresses, users")
                .execute(self.pool)
                .await?;
            Ok(())
        }
    }

    pub mod database {
        use log::LevelFilter;
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use sqlx::{ConnectOptions, PgPool};
        use testcontainers::core::error::TestcontainersError;
        use testcontainers::runners::AsyncRunner;
        use testcontainers::ContainerAsync;
        use testcontainers_modules::postgres::Postgres;
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database factory for integration tests.
        ///
        /// Each instance creates a uniquely named database on the server
        /// named by `TEST_DATABASE_URL`, or on a throwaway Postgres container
        /// when `TEST_DATABASE_CONTAINER=1`, and drops it again on close.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            /// Provision a fresh, migrated database.
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                    return Self::new(&url, None).await;
                }

                let use_container = std::env::var("TEST_DATABASE_CONTAINER")
                    .map(|value| value == "1")
                    .unwrap_or(false);
                if !use_container {
                    return Err(TestDatabaseError::MissingUrl);
                }

                let container = Postgres::default().start().await?;
                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                Self::new(&url, Some(container)).await
            }

            async fn new(
                base_url: &str,
                container: Option<ContainerAsync<Postgres>>,
            ) -> Result<Self, TestDatabaseError> {
                let base_options: PgConnectOptions = base_url.parse()?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await?;

                let new_db_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql).execute(&admin_pool).await?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container,
                })
            }

            /// Connection pool for the ephemeral database.
            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            /// Convenience method returning a clone of the pooled connection handle.
            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        /// Drop a per-test database from the maintenance connection. Servers
        /// older than PostgreSQL 13 reject `WITH (FORCE)`; for those the plain
        /// form is retried, which only succeeds once every pool is closed.
        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            let result = match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await.map(|_| ())
                }
                Err(err) => Err(err),
            };

            admin_pool.close().await;
            result
        }

        /// Syntax error or feature-not-supported on `DROP DATABASE ... WITH (FORCE)`.
        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        // A test that panics before `close` still leaves no database behind.
        // Cleanup runs on the current runtime when there is one and on a
        // short-lived runtime of its own otherwise.
        impl Drop for TestDatabase {
            fn drop(&mut self) {
                let Some(pool) = self.pool.take() else {
                    return;
                };
                let admin_options = self.admin_options.clone();
                let db_name = self.database_name.clone();
                let container = self.container.take();

                let teardown = async move {
                    pool.close().await;
                    if let Err(err) = drop_database_with_fallback(admin_options, &db_name).await {
                        log::warn!("failed to drop test database {}: {}", db_name, err);
                    }
                    drop(container);
                };

                if let Ok(handle) = Handle::try_current() {
                    handle.spawn(teardown);
                } else {
                    std::thread::spawn(move || {
                        if let Ok(rt) = tokio::runtime::Runtime::new() {
                            rt.block_on(teardown);
                        }
                    });
                }
            }
        }
    }
}
