// =============================================================================
// REST / WebSocket façade over the sync engine
// =============================================================================

pub mod rest;
pub mod ws;
