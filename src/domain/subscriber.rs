use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::subscriber_email::SubscriberEmail;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Subscriber {
    pub id: Uuid,
    pub email: SubscriberEmail,
    pub is_verified: bool,
    pub subscribed_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn new(email: SubscriberEmail, is_verified: bool, subscribed_at: DateTime<Utc>) -> Self {
        Subscriber {
            id: Uuid::new_v4(),
            email,
            is_verified,
            subscribed_at,
        }
    }
}
