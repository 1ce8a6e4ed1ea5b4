// =============================================================================
// Read-only API surface: REST snapshot endpoints + WebSocket event feed
// =============================================================================

pub mod rest;
pub mod ws;
