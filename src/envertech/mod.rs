pub mod client; // TCP session client (one-shot and streaming exchanges)
pub mod frame; // outbound command frame construction
pub mod telemetry; // inbound frame parsing into per-panel telemetry
