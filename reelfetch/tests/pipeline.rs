//! End-to-end pipeline tests against a fake ffmpeg.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{FAIL_MARKER, Fixture, HANG_MARKER, Recorder, files_under};
use reelfetch::Error;
use reelfetch::admission::{AdmissionReport, AdmissionRunner, RateLimiterConfig};
use reelfetch::dispatcher::Dispatcher;
use reelfetch::downloader::FfmpegDownloader;
use reelfetch::library::{Materializer, SHOW_METADATA_FILE, TemplateNamer};
use reelfetch::media::{DownloadItem, MediaInfo, ShowInfo, WatchTask};
use reelfetch::pipeline::{WorkerPool, WorkerPoolConfig};
use reelfetch::provider::{CatalogProvider, ProviderRegistry};

fn catalog(episodes: &[(&str, u32, &str, &str)]) -> String {
    let episodes: Vec<serde_json::Value> = episodes
        .iter()
        .map(|(id, number, title, url)| {
            serde_json::json!({
                "id": id,
                "episode": number,
                "title": title,
                "stream_urls": [url],
            })
        })
        .collect();
    serde_json::json!({
        "shows": [{
            "id": "show-1",
            "title": "Night Trains",
            "plot": "Rail journeys after dark.",
            "seasons": [{ "number": 1, "episodes": episodes }]
        }]
    })
    .to_string()
}

fn watch() -> Vec<WatchTask> {
    vec![WatchTask {
        provider: "catalog".into(),
        title: "Night Trains".into(),
        ..Default::default()
    }]
}

struct Agent {
    dispatcher: Dispatcher,
    materializer: Arc<Materializer>,
    pool: Arc<WorkerPool>,
    runner: AdmissionRunner,
}

fn agent(fx: &Fixture, catalog_json: &str, token: &CancellationToken) -> Agent {
    let catalog_path = fx.write_catalog(catalog_json);
    let registry = ProviderRegistry::new().with(Arc::new(CatalogProvider::new(
        catalog_path,
        fx.ffmpeg_config(Duration::from_secs(10)),
    )));
    let dispatcher = Dispatcher::new();
    let materializer = Arc::new(Materializer::new(
        &fx.library,
        Arc::new(TemplateNamer::default()),
        dispatcher.clone(),
        "mkv",
    ));
    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig {
            max_workers: 2,
            queue_capacity: 4,
            ..Default::default()
        },
        token,
    ));
    let runner = AdmissionRunner::new(
        registry,
        pool.clone(),
        materializer.clone(),
        RateLimiterConfig::with_rps(1000.0, 2.0).unwrap(),
    );
    Agent {
        dispatcher,
        materializer,
        pool,
        runner,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_item_leaves_only_its_siblings() {
    let fx = Fixture::new();
    let token = CancellationToken::new();
    let failing_url = format!("https://cdn/{FAIL_MARKER}/e2.m3u8");
    let mut agent = agent(
        &fx,
        &catalog(&[
            ("e1", 1, "Departure", "https://cdn/e1.m3u8"),
            ("e2", 2, "Sleeper", failing_url.as_str()),
            ("e3", 3, "Arrival", "https://cdn/e3.m3u8"),
        ]),
        &token,
    );
    let recorder = Recorder::attach(&agent.dispatcher);

    let report = agent.runner.run(&token, &watch()).await;
    agent.pool.stop(Duration::from_secs(10)).await.unwrap();
    recorder.settle().await;

    assert_eq!(report.accepted, 3);
    assert_eq!(
        files_under(&fx.library),
        vec![
            "Night Trains/Season 01/Night Trains - S01E01 - Departure.json",
            "Night Trains/Season 01/Night Trains - S01E01 - Departure.mkv",
            "Night Trains/Season 01/Night Trains - S01E03 - Arrival.json",
            "Night Trains/Season 01/Night Trains - S01E03 - Arrival.mkv",
            "Night Trains/Season 01/season.json",
            "Night Trains/show.json",
        ]
    );

    let errors = recorder.pinned_errors();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].text.contains("Sleeper"));
    assert!(errors[0].text.contains("404 Not Found"));

    let stats = agent.pool.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn duplicate_candidates_are_downloaded_once() {
    let fx = Fixture::new();
    let token = CancellationToken::new();
    let mut agent = agent(
        &fx,
        &catalog(&[
            ("e1", 1, "Departure", "https://cdn/e1.m3u8"),
            ("e1", 1, "Departure", "https://cdn/e1.m3u8"),
        ]),
        &token,
    );

    let report = agent.runner.run(&token, &watch()).await;
    agent.pool.stop(Duration::from_secs(10)).await.unwrap();

    assert_eq!(
        report,
        AdmissionReport {
            accepted: 1,
            duplicates: 1,
            already_present: 0,
            failed: 0,
        }
    );
    assert_eq!(fx.invocation_count(), 1);
}

#[tokio::test]
async fn second_run_skips_files_already_on_disk() {
    let fx = Fixture::new();
    let json = catalog(&[
        ("e1", 1, "Departure", "https://cdn/e1.m3u8"),
        ("e2", 2, "Sleeper", "https://cdn/e2.m3u8"),
    ]);

    let token = CancellationToken::new();
    let mut first = agent(&fx, &json, &token);
    first.runner.run(&token, &watch()).await;
    first.pool.stop(Duration::from_secs(10)).await.unwrap();

    let token = CancellationToken::new();
    let mut second = agent(&fx, &json, &token);
    let report = second.runner.run(&token, &watch()).await;
    second.pool.stop(Duration::from_secs(10)).await.unwrap();

    assert_eq!(report.already_present, 2);
    assert_eq!(report.accepted, 0);
    assert_eq!(fx.invocation_count(), 2);
}

#[tokio::test]
async fn unknown_provider_is_counted_as_failed() {
    let fx = Fixture::new();
    let token = CancellationToken::new();
    let mut agent = agent(&fx, &catalog(&[]), &token);

    let tasks = vec![WatchTask {
        provider: "nowhere".into(),
        title: "Night Trains".into(),
        ..Default::default()
    }];
    let report = agent.runner.run(&token, &tasks).await;
    agent.pool.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.failed, 1);
}

fn media(id: &str, episode: u32, plot: &str, url: &str) -> MediaInfo {
    MediaInfo {
        id: id.into(),
        show: "Night Trains".into(),
        season: 1,
        episode,
        title: format!("Episode {episode}"),
        stream_urls: vec![url.into()],
        show_info: Some(Arc::new(ShowInfo {
            id: "show-1".into(),
            title: "Night Trains".into(),
            plot: Some(plot.into()),
            images: Vec::new(),
        })),
        ..Default::default()
    }
}

fn item(fx: &Fixture, media: MediaInfo, watchdog: Duration) -> DownloadItem {
    let downloader = FfmpegDownloader::new(fx.ffmpeg_config(watchdog), media.stream_urls.clone());
    DownloadItem::new(media, Box::new(downloader))
}

#[tokio::test]
async fn show_metadata_is_written_once() {
    let fx = Fixture::new();
    let m = Materializer::new(
        &fx.library,
        Arc::new(TemplateNamer::default()),
        Dispatcher::new(),
        "mkv",
    );

    let first = media("e1", 1, "first", "https://cdn/e1.m3u8");
    let second = media("e2", 2, "second", "https://cdn/e2.m3u8");
    m.download_one(CancellationToken::new(), item(&fx, first, Duration::from_secs(10)))
        .await
        .unwrap();
    m.download_one(CancellationToken::new(), item(&fx, second, Duration::from_secs(10)))
        .await
        .unwrap();

    let show_json = fx.library.join("Night Trains").join(SHOW_METADATA_FILE);
    let show: ShowInfo = serde_json::from_slice(&std::fs::read(show_json).unwrap()).unwrap();
    assert_eq!(show.plot.as_deref(), Some("first"));
}

#[tokio::test]
async fn cancelled_download_leaves_no_artifacts() {
    let fx = Fixture::new();
    let dispatcher = Dispatcher::new();
    let recorder = Recorder::attach(&dispatcher);
    let m = Materializer::new(
        &fx.library,
        Arc::new(TemplateNamer::default()),
        dispatcher,
        "mkv",
    );
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let target = media("e1", 1, "p", &format!("https://cdn/{HANG_MARKER}/e1.m3u8"));
    let started = std::time::Instant::now();
    let err = m
        .download_one(token, item(&fx, target, Duration::from_secs(30)))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(files_under(&fx.library).is_empty());
    assert_eq!(std::fs::read_dir(&fx.library).unwrap().count(), 0);

    recorder.settle().await;
    assert_eq!(recorder.pinned_errors().len(), 1);
}

#[tokio::test]
async fn stalled_download_times_out_and_is_cleaned_up() {
    let fx = Fixture::new();
    let m = Materializer::new(
        &fx.library,
        Arc::new(TemplateNamer::default()),
        Dispatcher::new(),
        "mkv",
    );

    let target = media("e1", 1, "p", &format!("https://cdn/{HANG_MARKER}/e1.m3u8"));
    let started = std::time::Instant::now();
    let err = m
        .download_one(
            CancellationToken::new(),
            item(&fx, target, Duration::from_millis(300)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(std::fs::read_dir(&fx.library).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_deadline_cleans_up_running_downloads() {
    let fx = Fixture::new();
    let token = CancellationToken::new();
    let hanging_url = format!("https://cdn/{HANG_MARKER}/e1.m3u8");
    let mut agent = agent(
        &fx,
        &catalog(&[("e1", 1, "Departure", hanging_url.as_str())]),
        &token,
    );
    let recorder = Recorder::attach(&agent.dispatcher);

    let report = agent.runner.run(&token, &watch()).await;
    assert_eq!(report.accepted, 1);
    // Wait for the partial file so the stop hits a running download.
    let partial = agent
        .materializer
        .destination(&MediaInfo {
            id: "e1".into(),
            show: "Night Trains".into(),
            season: 1,
            episode: 1,
            title: "Departure".into(),
            ..Default::default()
        })
        .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !partial.exists() {
        assert!(std::time::Instant::now() < deadline, "download never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let err = agent
        .pool
        .stop(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err}");
    assert_eq!(agent.pool.stats().cancelled, 1);
    assert_eq!(std::fs::read_dir(&fx.library).unwrap().count(), 0);

    recorder.settle().await;
    assert_eq!(recorder.pinned_errors().len(), 1);
}
