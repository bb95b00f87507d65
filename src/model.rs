mod bounce;
mod delivery;
mod issue;
mod newsletter;
mod recipient;
mod subscription;

pub use bounce::{Bounce, BounceKind, NewBounce};
pub use delivery::{Delivery, NewDelivery};
pub use issue::{DeliveryStatus, Issue};
pub use newsletter::{Newsletter, SubscriptionMode};
pub use recipient::Recipient;
pub use subscription::{Subscription, SubscriberHealth};
