// Service Layer
//
// Orchestration between validators, repositories, cache, and delivery.

pub mod application;
pub mod statistics;
pub mod tracking;
pub mod webhook;

pub use application::ApplicationService;
pub use statistics::StatisticsService;
pub use tracking::TrackingService;
pub use webhook::WebhookService;
