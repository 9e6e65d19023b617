pub mod delivery_status;
pub mod email_send;
pub mod newsletter;
pub mod send_status;
pub mod subscriber;
pub mod subscriber_email;
pub mod token;
