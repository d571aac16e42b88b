pub mod articles;
pub mod subscriptions;
pub mod sync_state;

pub use articles::{ArticleRepository, SaveArticlesResult};
pub use subscriptions::SubscriptionRepository;
pub use sync_state::SyncStateRepository;
