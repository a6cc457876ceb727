mod common;

use common::{Behavior, FakeEngine, Harness, make_pdf, page_count, write_blob_pdf};
use docshrink::{
    engine::Engine,
    error::FatalJobError,
    pipeline::{CompressionJob, FALLBACK_WARNING, ORIGINAL_FALLBACK, Pipeline},
    telemetry::{TelemetryEvent, sink_from_config},
    validate::OutputValidator,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn attempt_outcomes(h: &Harness) -> Vec<(String, String)> {
    h.sink
        .records()
        .into_iter()
        .filter_map(|r| match r.event {
            TelemetryEvent::Attempt { tier, outcome, .. } => Some((tier, outcome)),
            _ => None,
        })
        .collect()
}

fn single_job(h: &Harness, input: PathBuf, quality: u8) -> CompressionJob {
    CompressionJob::new("job-1", vec![input], quality, &h.out_dir())
}

#[test]
fn primary_result_is_used_when_smaller() {
    let h = Harness::new();
    let input = h.path("big.pdf");
    write_blob_pdf(&input, 2_000_000);

    let primary = FakeEngine::new("primary", Behavior::ShrinkTo(1_500_000));
    let pipeline = h
        .pipeline(&[primary.tool_name()], Some(primary.clone()), None)
        .with_validator(OutputValidator::header_only());

    let outcome = pipeline.compress(&single_job(&h, input, 60)).unwrap();
    let r = &outcome.results[0];
    assert_eq!(outcome.job_id, "job-1");
    assert_eq!(r.engine_used, "primary");
    assert_eq!(r.input_bytes, 2_000_000);
    assert_eq!(r.output_bytes, 1_500_000);
    assert!(r.warning.is_none());
    assert_eq!(std::fs::metadata(&r.output_path).unwrap().len(), 1_500_000);
    assert_eq!(
        attempt_outcomes(&h),
        vec![("primary".to_string(), "accepted".to_string())]
    );
}

#[test]
fn missing_engines_fall_back_to_the_original() {
    let h = Harness::new();
    let input = h.path("doc.pdf");
    write_blob_pdf(&input, 40_000);

    let primary = FakeEngine::new("primary", Behavior::ShrinkTo(100));
    let secondary = FakeEngine::new("secondary", Behavior::ShrinkTo(100));
    let pipeline = h.pipeline(&[], Some(primary.clone()), Some(secondary.clone()));

    let outcome = pipeline.compress(&single_job(&h, input.clone(), 60)).unwrap();
    let r = &outcome.results[0];
    assert_eq!(r.engine_used, ORIGINAL_FALLBACK);
    assert_eq!(r.output_bytes, r.input_bytes);
    assert_eq!(r.warning.as_deref(), Some(FALLBACK_WARNING));
    assert_eq!(std::fs::read(&r.output_path).unwrap(), std::fs::read(&input).unwrap());
    assert_eq!(primary.compress_calls.load(Ordering::SeqCst), 0);
    assert_eq!(secondary.compress_calls.load(Ordering::SeqCst), 0);

    let outcomes = attempt_outcomes(&h);
    assert!(outcomes.contains(&("primary".to_string(), "unavailable".to_string())));
    assert!(outcomes.contains(&("secondary".to_string(), "unavailable".to_string())));
}

#[test]
fn secondary_runs_after_primary_fails() {
    let h = Harness::new();
    let input = h.path("doc.pdf");
    write_blob_pdf(&input, 50_000);

    let primary = FakeEngine::new("primary", Behavior::Fail(1));
    let secondary = FakeEngine::new("secondary", Behavior::ShrinkTo(30_000));
    let pipeline = h
        .pipeline(
            &[primary.tool_name(), secondary.tool_name()],
            Some(primary.clone()),
            Some(secondary.clone()),
        )
        .with_validator(OutputValidator::header_only());

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, "secondary");
    assert_eq!(r.output_bytes, 30_000);
    assert_eq!(
        attempt_outcomes(&h),
        vec![
            ("primary".to_string(), "non_zero_exit".to_string()),
            ("secondary".to_string(), "accepted".to_string()),
        ]
    );
}

#[test]
fn primary_failure_without_secondary_returns_original() {
    let h = Harness::new();
    let input = h.path("doc.pdf");
    write_blob_pdf(&input, 10_000);

    let primary = FakeEngine::new("primary", Behavior::Fail(2));
    let pipeline = h.pipeline(&[primary.tool_name()], Some(primary.clone()), None);

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, ORIGINAL_FALLBACK);
    assert_eq!(r.output_bytes, 10_000);
}

#[test]
fn inflated_output_is_rejected() {
    let h = Harness::new();
    let input = h.path("doc.pdf");
    write_blob_pdf(&input, 10_000);

    let primary = FakeEngine::new("primary", Behavior::Inflate);
    let pipeline = h
        .pipeline(&[primary.tool_name()], Some(primary.clone()), None)
        .with_validator(OutputValidator::header_only());

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, ORIGINAL_FALLBACK);
    assert_eq!(
        attempt_outcomes(&h),
        vec![("primary".to_string(), "regression_rejected".to_string())]
    );
}

#[test]
fn regression_guard_boundary() {
    for (candidate, accepted) in [(1_050_000u64, false), (1_040_000u64, true)] {
        let h = Harness::new();
        let input = h.path("doc.pdf");
        write_blob_pdf(&input, 1_000_000);

        let primary = FakeEngine::new("primary", Behavior::ShrinkTo(candidate));
        let pipeline = h
            .pipeline(&[primary.tool_name()], Some(primary.clone()), None)
            .with_validator(OutputValidator::header_only());

        let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
        if accepted {
            assert_eq!(r.engine_used, "primary", "candidate {candidate}");
            assert_eq!(r.output_bytes, candidate);
        } else {
            assert_eq!(r.engine_used, ORIGINAL_FALLBACK, "candidate {candidate}");
            assert_eq!(r.output_bytes, 1_000_000);
        }
    }
}

#[test]
fn non_document_output_is_invalid() {
    let h = Harness::new();
    let input = h.path("doc.pdf");
    write_blob_pdf(&input, 10_000);

    let primary = FakeEngine::new("primary", Behavior::Garbage);
    let pipeline = h.pipeline(&[primary.tool_name()], Some(primary.clone()), None);

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, ORIGINAL_FALLBACK);
    assert_eq!(
        attempt_outcomes(&h),
        vec![("primary".to_string(), "invalid_output".to_string())]
    );
}

#[test]
fn long_documents_are_chunked_and_merged_in_order() {
    let h = Harness::new();
    let input = h.path("long.pdf");
    std::fs::write(&input, make_pdf(20, 50_000)).unwrap();

    let primary = FakeEngine::with_delay("gs-fake", Behavior::Pages, Duration::from_millis(50));
    let pipeline = h.pipeline(&[primary.tool_name()], Some(primary.clone()), None);

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, "gs-fake-parallel");
    assert!(r.warning.is_none());
    assert_eq!(page_count(&r.output_path), 20);

    assert_eq!(primary.compress_calls.load(Ordering::SeqCst), 4);
    let peak = primary.peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= h.cfg.concurrency.inner, "peak {peak}");

    let names: Vec<String> = primary
        .merged_parts
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec!["chunk_00000.pdf", "chunk_00001.pdf", "chunk_00002.pdf", "chunk_00003.pdf"]
    );

    let leftovers = std::fs::read_dir(h.work_dir()).unwrap().count();
    assert_eq!(leftovers, 0, "working files must be cleaned up");
}

#[test]
fn known_page_count_skips_the_page_scan() {
    let h = Harness::new();
    let input = h.path("opaque.pdf");
    write_blob_pdf(&input, 200_000);

    let primary = FakeEngine::new("gs-fake", Behavior::Pages);
    let pipeline = h.pipeline(&[primary.tool_name()], Some(primary.clone()), None);

    let job = single_job(&h, input, 60).with_page_count(8);
    let r = pipeline.compress(&job).unwrap().results.remove(0);
    assert_eq!(r.engine_used, "gs-fake-parallel");
    assert_eq!(page_count(&r.output_path), 8);
    assert_eq!(primary.compress_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn chunk_failure_falls_through_to_whole_file_primary() {
    let h = Harness::new();
    let input = h.path("long.pdf");
    std::fs::write(&input, make_pdf(12, 50_000)).unwrap();

    let primary = FakeEngine::new("gs-fake", Behavior::FailChunks);
    let pipeline = h.pipeline(&[primary.tool_name()], Some(primary.clone()), None);

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, "gs-fake");
    assert_eq!(page_count(&r.output_path), 12);

    let outcomes = attempt_outcomes(&h);
    assert_eq!(
        outcomes,
        vec![
            ("parallel_chunked".to_string(), "chunk_failed".to_string()),
            ("primary".to_string(), "accepted".to_string()),
        ]
    );
    assert!(primary.merged_parts.lock().unwrap().is_empty());
}

#[test]
fn chunk_timeout_aborts_the_parallel_tier() {
    let h = Harness::new();
    let input = h.path("long.pdf");
    std::fs::write(&input, make_pdf(12, 50_000)).unwrap();

    let primary = FakeEngine::new("gs-fake", Behavior::TimeoutChunks);
    let pipeline = h.pipeline(&[primary.tool_name()], Some(primary.clone()), None);

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, "gs-fake");
    assert_eq!(page_count(&r.output_path), 12);
    assert_eq!(
        attempt_outcomes(&h),
        vec![
            ("parallel_chunked".to_string(), "chunk_failed".to_string()),
            ("primary".to_string(), "accepted".to_string()),
        ]
    );
    assert!(primary.merged_parts.lock().unwrap().is_empty());
}

#[test]
fn inflated_chunked_output_skips_the_same_engine_whole_file() {
    let h = Harness::new();
    let input = h.path("long.pdf");
    std::fs::write(&input, make_pdf(12, 50_000)).unwrap();

    let primary = FakeEngine::new("gs-fake", Behavior::InflateChunks);
    let pipeline = h.pipeline(&[primary.tool_name()], Some(primary.clone()), None);

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, ORIGINAL_FALLBACK);
    assert_eq!(
        attempt_outcomes(&h),
        vec![("parallel_chunked".to_string(), "regression_rejected".to_string())]
    );
    // Three chunks, no whole-file run.
    assert_eq!(primary.compress_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn spawn_failure_falls_through_to_secondary() {
    let h = Harness::new();
    let input = h.path("doc.pdf");
    write_blob_pdf(&input, 200_000);

    let primary = FakeEngine::new("gs-fake", Behavior::SpawnFails);
    let secondary = FakeEngine::new("qpdf-fake", Behavior::ShrinkTo(150_000));
    let pipeline = h
        .pipeline(
            &[primary.tool_name(), secondary.tool_name()],
            Some(primary.clone()),
            Some(secondary.clone()),
        )
        .with_validator(OutputValidator::header_only());

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, "qpdf-fake");
    assert_eq!(r.output_bytes, 150_000);
    assert_eq!(
        attempt_outcomes(&h),
        vec![
            ("primary".to_string(), "spawn_error".to_string()),
            ("secondary".to_string(), "accepted".to_string()),
        ]
    );
}

#[test]
fn default_pipeline_survives_missing_binaries_and_telemetry_path() {
    let mut h = Harness::new();
    let blocker = h.path("blocker");
    std::fs::write(&blocker, b"regular file").unwrap();
    h.cfg.engines.ghostscript_exe = h.path("no-gs").display().to_string();
    h.cfg.engines.qpdf_exe = h.path("no-qpdf").display().to_string();
    h.cfg.telemetry.enabled = true;
    h.cfg.telemetry.path = blocker.join("telemetry.jsonl").display().to_string();

    let input = h.path("doc.pdf");
    write_blob_pdf(&input, 50_000);
    let pipeline = Pipeline::from_config(&h.cfg, sink_from_config(&h.cfg));

    let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
    assert_eq!(r.engine_used, ORIGINAL_FALLBACK);
    assert_eq!(r.output_bytes, 50_000);
    assert_eq!(r.warning.as_deref(), Some(FALLBACK_WARNING));
}

#[test]
fn multi_file_job_keeps_input_order() {
    let h = Harness::new();
    let sizes = [30_000usize, 10_000, 20_000];
    let inputs: Vec<PathBuf> = sizes
        .iter()
        .enumerate()
        .map(|(i, size)| {
            let p = h.path(&format!("in-{i}.pdf"));
            write_blob_pdf(&p, *size);
            p
        })
        .collect();

    let primary = FakeEngine::new("primary", Behavior::ShrinkTo(500));
    let pipeline = h
        .pipeline(&[primary.tool_name()], Some(primary.clone()), None)
        .with_validator(OutputValidator::header_only());

    let job = CompressionJob::new("multi", inputs, 40, &h.out_dir());
    let outcome = pipeline.compress(&job).unwrap();

    let input_bytes: Vec<u64> = outcome.results.iter().map(|r| r.input_bytes).collect();
    assert_eq!(input_bytes, vec![30_000, 10_000, 20_000]);

    let outputs: HashSet<PathBuf> = outcome.results.iter().map(|r| r.output_path.clone()).collect();
    assert_eq!(outputs.len(), 3);
    assert!(outputs.iter().all(|p| p.exists()));
    assert!(primary.peak.load(Ordering::SeqCst) <= h.cfg.concurrency.outer);
}

#[test]
fn contract_violations_are_fatal_and_silent() {
    let h = Harness::new();
    let primary = FakeEngine::new("primary", Behavior::ShrinkTo(10));
    let pipeline = h.pipeline(&[primary.tool_name()], Some(primary.clone()), None);

    let empty = CompressionJob::new("none", vec![], 50, &h.out_dir());
    assert!(matches!(pipeline.compress(&empty), Err(FatalJobError::NoInputs(_))));

    let input = h.path("doc.pdf");
    write_blob_pdf(&input, 1_000);
    let too_high = CompressionJob::new("q", vec![input], 101, &h.out_dir());
    assert!(matches!(
        pipeline.compress(&too_high),
        Err(FatalJobError::QualityOutOfRange(101))
    ));

    let missing = CompressionJob::new("m", vec![h.path("absent.pdf")], 50, &h.out_dir());
    assert!(matches!(
        pipeline.compress(&missing),
        Err(FatalJobError::MissingInput(_))
    ));

    assert!(h.sink.records().is_empty());
    assert_eq!(primary.compress_calls.load(Ordering::SeqCst), 0);
}

#[cfg(unix)]
mod process_timeouts {
    use super::*;
    use docshrink::engine::CompressRequest;
    use docshrink::error::TierFailure;
    use docshrink::supervisor::{ProcessOutput, ProcessSupervisor};

    /// Runs `sleep` through the real supervisor and never produces output.
    struct SleepEngine;

    impl Engine for SleepEngine {
        fn name(&self) -> &str {
            "sleeper"
        }

        fn tool(&self) -> &str {
            "sleep"
        }

        fn compress(
            &self,
            _req: &CompressRequest,
            supervisor: &ProcessSupervisor,
            timeout: Duration,
        ) -> Result<ProcessOutput, TierFailure> {
            Ok(supervisor.run("sleep", &["30"], None, timeout)?)
        }
    }

    #[test]
    fn hung_engine_is_killed_and_original_returned() {
        let mut h = Harness::new();
        h.cfg.timeouts.primary_resize_secs = 1;
        let input = h.path("doc.pdf");
        write_blob_pdf(&input, 5_000);

        let pipeline = h.pipeline(&["sleep".to_string()], Some(Arc::new(SleepEngine)), None);

        let started = std::time::Instant::now();
        let r = pipeline.compress(&single_job(&h, input, 60)).unwrap().results.remove(0);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(r.engine_used, ORIGINAL_FALLBACK);
        assert_eq!(
            attempt_outcomes(&h),
            vec![("primary".to_string(), "timeout".to_string())]
        );
    }
}
