pub mod app_config;
pub mod booking_repo;
pub mod database;
pub mod events;
pub mod redis_repo;
pub mod trip_repo;

pub use booking_repo::PgBookingRepository;
pub use database::DbClient;
pub use events::EventProducer;
pub use redis_repo::{RedisExpirySource, RedisSeatLockStore};
pub use trip_repo::PgTripInventoryRepository;
