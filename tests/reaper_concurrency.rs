#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{MockProvider, RecordingSink, fast_config, patient_config, wait_until};
use zip_reaper::config::ReaperConfig;
use zip_reaper::reaper::{Reaper, RecordState};

const THREADS: usize = 8;

fn shared_reaper(config: ReaperConfig) -> (Arc<Reaper<MockProvider>>, MockProvider) {
    let provider = MockProvider::new();
    let reaper = Reaper::new(
        provider.clone(),
        config,
        Arc::new(RecordingSink::default()),
    )
    .unwrap();
    (Arc::new(reaper), provider)
}

#[test]
fn held_archive_is_opened_once_under_contention() {
    let (reaper, provider) = shared_reaper(patient_config());
    let path = PathBuf::from("/hot.zip");
    let held = reaper.open(&path).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let reaper = Arc::clone(&reaper);
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..200 {
                    let archive = reaper.open(&path).unwrap();
                    assert_eq!(archive.path, path);
                    reaper.close(&path).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(provider.opens("/hot.zip"), 1);
    let snap = reaper.snapshot(&path).unwrap();
    assert_eq!(snap.state, RecordState::Open);
    assert_eq!(snap.active_opens(), 1);
    assert_eq!(snap.open_count, 1 + (THREADS as u64) * 200);
    drop(held);
}

#[test]
fn opens_and_closes_balance_under_churn() {
    let (reaper, provider) = shared_reaper(ReaperConfig {
        max_pending: 2,
        ..fast_config()
    });
    let paths: Vec<PathBuf> = (0..6).map(|i| PathBuf::from(format!("/{i}.zip"))).collect();

    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let reaper = Arc::clone(&reaper);
            let barrier = Arc::clone(&barrier);
            let paths = paths.clone();
            std::thread::spawn(move || {
                barrier.wait();
                for i in 0..300 {
                    let path = &paths[(t * 7 + i * 3) % paths.len()];
                    reaper.open(path).unwrap();
                    if i % 50 == 0 {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    reaper.close(path).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for path in &paths {
        let snap = reaper.snapshot(path).unwrap();
        assert_eq!(snap.active_opens(), 0, "{}", path.display());
        assert_ne!(snap.state, RecordState::Open);
    }

    // Everything left pending is reaped in the background.
    assert!(wait_until(Duration::from_secs(3), || provider.held() == 0));
    assert_eq!(reaper.active_len(), 0);
    assert_eq!(reaper.stats().misuses, 0);
}

#[test]
fn shutdown_during_traffic_closes_everything() {
    let (reaper, provider) = shared_reaper(fast_config());
    let paths: Vec<PathBuf> = (0..4).map(|i| PathBuf::from(format!("/{i}.zip"))).collect();

    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let reaper = Arc::clone(&reaper);
            let barrier = Arc::clone(&barrier);
            let paths = paths.clone();
            std::thread::spawn(move || {
                barrier.wait();
                for i in 0.. {
                    let path = &paths[(t + i) % paths.len()];
                    if reaper.open(path).is_err() {
                        // Inactive from here on.
                        break;
                    }
                    reaper.close(path).unwrap();
                }
            })
        })
        .collect();

    barrier.wait();
    std::thread::sleep(Duration::from_millis(50));
    reaper.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(!reaper.is_active());
    assert_eq!(provider.held(), 0);
    for path in &paths {
        if let Some(snap) = reaper.snapshot(path) {
            assert_eq!(snap.state, RecordState::FullyClosed);
        }
    }
}
