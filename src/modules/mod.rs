pub mod live;
pub mod uploads;
pub mod webhooks;
