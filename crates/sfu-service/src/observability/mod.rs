//! Observability for the SFU service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Metric labels are bounded:
//! - `actor_type`: 4 values (registry, pool, room, connection)
//! - `kind`: 3 values (transport, producer, consumer)
//! - `reason`: bounded close reasons
//! - `method`: bounded by the signaling method table
//! - `code`: bounded by `SfuError::error_code`
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Rooms with a live router |
//! | `sfu_connections_active` | Gauge | none | Open signaling connections |
//! | `sfu_workers_alive` | Gauge | none | Media workers able to host routers |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure per actor type |
//! | `sfu_signaling_latency_seconds` | Histogram | `method` | Request handling latency |
//! | `sfu_signaling_errors_total` | Counter | `method`, `code` | Failed requests |
//! | `sfu_entities_created_total` | Counter | `kind` | Transports, producers, consumers |
//! | `sfu_entities_closed_total` | Counter | `kind`, `reason` | Close cascades |
//! | `sfu_consume_rejected_total` | Counter | none | Incompatible consume attempts |
//! | `sfu_worker_deaths_total` | Counter | none | Worker crashes |
//! | `sfu_worker_respawns_total` | Counter | none | Successful respawns |
//! | `sfu_notifications_dropped_total` | Counter | `event` | Slow-client drops |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Actor panics |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
