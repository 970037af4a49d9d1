// Market data module entrypoint
pub mod adapters;      // provider wire codecs (Birdeye, Helius)
pub mod wire;          // canonical snapshot / delta model
pub mod reconnect;     // backoff + jitter
pub mod health;        // heartbeat and staleness
pub mod queue;         // drop-oldest event buffer
pub mod subscription;  // refcounted keys, batched commands
pub mod connection;    // one provider socket
pub mod fallback;      // REST polling while streaming is down
pub mod merger;        // snapshot + delta reconstruction
pub mod router;        // orchestrates everything
