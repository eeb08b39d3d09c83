use chrono::{DateTime, TimeDelta, Utc};
use nalgebra::Vector2;
use rand::{Rng, SeedableRng, rngs::StdRng};
use test_log::test;

use field_config_data::SmootherConfig;
use field_types::PositionSample;
use trajectory::{TrajectorySmoother, TripSource, TripTracker};

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn sample(lat: f64, lon: f64, speed: f64, secs: i64) -> PositionSample {
    PositionSample {
        lat,
        lon,
        speed,
        accuracy: 5.0,
        timestamp: t0() + TimeDelta::seconds(secs),
    }
}

fn between(x: f64, a: f64, b: f64) -> bool {
    let eps = 1e-12;
    x >= a.min(b) - eps && x <= a.max(b) + eps
}

/// With monotonic timestamps, every output lies between the prior estimate
/// and the new measurement, and the gain stays in [0, 1].
#[test]
fn test_convex_combination_random_walk() {
    let mut rng = StdRng::seed_from_u64(1234);
    let mut smoother = TrajectorySmoother::new(&SmootherConfig::default());

    let mut t = t0();
    let mut truth = Vector2::new(47.37, 8.54);
    smoother
        .process(truth, 10.0, t, 0.0)
        .unwrap();

    for _ in 0..2000 {
        t += TimeDelta::milliseconds(rng.random_range(1..5000));
        truth += Vector2::new(rng.random_range(-1e-4..1e-4), rng.random_range(-1e-4..1e-4));
        let noise = Vector2::new(rng.random_range(-5e-5..5e-5), rng.random_range(-5e-5..5e-5));
        let measurement = truth + noise;
        let accuracy = rng.random_range(0.0..50.0);
        let speed = rng.random_range(0.0..40.0);

        let prior = smoother.position().unwrap();
        let post = smoother.process(measurement, accuracy, t, speed).unwrap();
        let gain = smoother.last_gain().unwrap();

        assert!((0.0..=1.0).contains(&gain), "gain {gain}");
        assert!(between(post.lat, prior.lat, measurement[0]));
        assert!(between(post.lon, prior.lon, measurement[1]));
        assert!(post.variance_estimate >= 0.0);
    }
}

/// An update step in isolation never increases the variance.
#[test]
fn test_update_without_predict_shrinks_variance() {
    let mut smoother = TrajectorySmoother::new(&SmootherConfig::default());
    smoother.process(Vector2::new(1.0, 1.0), 8.0, t0(), 0.0).unwrap();
    let mut previous = smoother.position().unwrap().variance_estimate;
    for i in 0..20 {
        // same timestamp: predict is skipped
        let p = smoother
            .process(Vector2::new(1.0 + i as f64 * 1e-5, 1.0), 8.0, t0(), 20.0)
            .unwrap();
        assert!(p.variance_estimate <= previous);
        previous = p.variance_estimate;
    }
}

#[test]
fn test_trip_tracker_odometer() {
    let tracker = TripTracker::new(&SmootherConfig::default());
    assert!(tracker.snapshot().is_none());

    // Move north in a straight line, ~11 m per sample.
    let mut last = 0.0;
    for i in 0..50 {
        let snap = tracker
            .on_sample(&sample(10.0 + i as f64 * 1e-4, 20.0, 11.0, i))
            .unwrap();
        assert!(snap.distance_m >= last);
        last = snap.distance_m;
    }
    let snap = tracker.snapshot().unwrap();
    assert_eq!(snap.speed_mps, 11.0);
    // smoothing lags but the bulk of the ~545 m is covered
    assert!(snap.distance_m > 400.0 && snap.distance_m < 560.0, "{}", snap.distance_m);

    tracker.reset();
    assert!(tracker.snapshot().is_none());
    let snap = tracker.on_sample(&sample(0.0, 0.0, 0.0, 100)).unwrap();
    assert_eq!(snap.distance_m, 0.0);
}

#[test]
fn test_trip_tracker_rejects_non_finite_samples() {
    let tracker = TripTracker::new(&SmootherConfig::default());
    let first = tracker.on_sample(&sample(10.0, 20.0, 8.0, 0)).unwrap();

    let mut bad = Vec::new();
    for (i, value) in [f64::INFINITY, f64::NAN, f64::NEG_INFINITY].into_iter().enumerate() {
        let secs = i as i64 + 1;
        bad.push(sample(10.0, 20.0, value, secs));
        bad.push(sample(value, 20.0, 8.0, secs));
        bad.push(PositionSample {
            accuracy: value,
            ..sample(10.0, 20.0, 8.0, secs)
        });
    }
    for s in bad.iter() {
        assert_eq!(
            tracker.on_sample(s),
            Err(trajectory::TrajectoryError::NonFiniteSample)
        );
    }
    assert_eq!(tracker.snapshot(), Some(first));
}

#[test(tokio::test)]
async fn test_follow_watch_channel() {
    let tracker = TripTracker::new(&SmootherConfig::default());
    let (tx, rx) = tokio::sync::watch::channel(None);
    let (trigger, tripwire) = stream_cancel::Tripwire::new();

    let jh = tokio::spawn(tracker.clone().follow(rx, tripwire));

    tx.send(Some(sample(1.0, 2.0, 3.0, 0))).unwrap();
    for _ in 0..100 {
        if tracker.snapshot().is_some() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let snap = tracker.snapshot().unwrap();
    assert_eq!((snap.position.lat, snap.position.lon), (1.0, 2.0));

    drop(trigger);
    jh.await.unwrap();
}
