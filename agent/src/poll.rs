//! Polling trigger mode, used when the node problem detector is bypassed:
//! no node conditions exist to watch, so the metadata service is queried on
//! a jittered interval instead.
use std::future::Future;
use std::pin::pin;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, Duration};
use tracing::info;

use models::config::SharedConfig;
use models::node::NodeClient;

use crate::events::EventSink;
use crate::imds::ImdsProbe;
use crate::reconciler::{Reconciler, Trigger};

/// The next polling interval with ±0.5s of uniform jitter, sampled
/// independently for every tick so co-scheduled agents spread out.
fn jittered_interval(base: Duration, rng: &mut impl Rng) -> Duration {
    let jitter = rng.gen_range(-0.5f64..=0.5f64);
    // the interval floor is one second, so this can never go negative
    Duration::from_secs_f64(base.as_secs_f64() + jitter)
}

/// Run the polling driver until shutdown: one immediate pass, then one pass
/// per jittered tick. The interval is re-read from configuration each tick so
/// hot reloads apply without a restart.
pub async fn run_poll_driver<C, P, S>(
    reconciler: &Reconciler<C, P, S>,
    config: SharedConfig,
    shutdown: impl Future<Output = ()>,
) where
    C: NodeClient,
    P: ImdsProbe,
    S: EventSink,
{
    let mut rng = StdRng::from_entropy();
    info!("bypassing the node problem detector, querying the metadata service directly");

    // Immediate first pass instead of waiting out a full interval.
    reconciler.reconcile(Trigger::Poll).await;

    let mut shutdown = pin!(shutdown);
    loop {
        let base = Duration::from_secs(
            config
                .snapshot()
                .optional_conditions
                .polling_interval
                .max(1),
        );
        let tick = jittered_interval(base, &mut rng);

        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping the polling loop");
                break;
            }
            _ = sleep(tick) => reconciler.reconcile(Trigger::Poll).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_half_a_second() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_secs(10);

        for _ in 0..1_000 {
            let tick = jittered_interval(base, &mut rng);
            assert!(tick >= Duration::from_secs_f64(9.5), "tick too short: {tick:?}");
            assert!(tick <= Duration::from_secs_f64(10.5), "tick too long: {tick:?}");
        }
    }

    #[test]
    fn jitter_is_sampled_per_tick() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_secs(10);

        let first = jittered_interval(base, &mut rng);
        let distinct = (0..100).any(|_| jittered_interval(base, &mut rng) != first);
        assert!(distinct);
    }

    #[test]
    fn jitter_respects_the_interval_floor() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..1_000 {
            let tick = jittered_interval(Duration::from_secs(1), &mut rng);
            assert!(tick >= Duration::from_secs_f64(0.5));
        }
    }
}
