//! Well-known tool names.
//!
//! The reducer projects these tools' payloads into typed slots; the
//! planner's deterministic fallback table plans them. Tenants may
//! whitelist any subset (plus tools the core knows nothing about).

pub const CHECK_AVAILABILITY: &str = "check_availability";
pub const GET_AVAILABILITY: &str = "get_availability";
pub const BOOK_APPOINTMENT: &str = "book_appointment";
pub const CANCEL_APPOINTMENT: &str = "cancel_appointment";
pub const GET_SERVICES: &str = "get_services";
pub const GET_BUSINESS_HOURS: &str = "get_business_hours";
