use std::sync::Arc;

use crate::{
    config::Config,
    database::{RedisLedger, init_redis},
};

pub struct AppState {
    pub config: Config,
    pub ledger: RedisLedger,
}

impl AppState {
    pub async fn new() -> Arc<Self> {
        let config = Config::load();

        let redis_connection = init_redis(&config.redis_url).await;
        let ledger = RedisLedger::new(redis_connection);

        Arc::new(Self { config, ledger })
    }
}
