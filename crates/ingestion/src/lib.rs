pub mod parser;
pub mod raw;
pub mod source;

pub use parser::SwapParser;
pub use raw::RawTransaction;
pub use source::poll::PollSource;
pub use source::rate_limit::FixedWindowLimiter;
pub use source::subscription::SubscriptionSource;
pub use source::webhook::WebhookIngest;
pub use source::ProducerDeps;
