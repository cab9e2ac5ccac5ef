use sensor_pipeline_lib::{
    Pipeline, PipelineError, SimulatedBackend, StreamFormat, StreamKey, StreamKind, StreamRequest,
};
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEPTH_CAMERA: &str = "841612070098";

/// Test synchronized frameset assembly, the retained slot and blocking retrieval
#[cfg(test)]
mod frame_delivery_tests {
    use super::*;

    fn depth_key() -> StreamKey {
        StreamKey::new(StreamKind::Depth, 0)
    }

    fn color_key() -> StreamKey {
        StreamKey::new(StreamKind::Color, 0)
    }

    /// Depth 640x480@30 + color 1280x720@30, streaming with manual sample injection
    fn create_streaming_pipeline() -> (Arc<SimulatedBackend>, Arc<Pipeline>) {
        let backend = Arc::new(SimulatedBackend::new(SimulatedBackend::default_catalog()));
        let pipeline = Arc::new(Pipeline::new(backend.clone()));
        pipeline
            .enable_stream(StreamRequest::video(StreamKind::Depth, 640, 480, StreamFormat::Any, 30))
            .unwrap();
        pipeline
            .enable_stream(StreamRequest::video(StreamKind::Color, 1280, 720, StreamFormat::Any, 30))
            .unwrap();
        pipeline.start().expect("Failed to start test pipeline");
        (backend, pipeline)
    }

    #[test]
    fn test_matching_samples_form_one_frameset() {
        let (backend, pipeline) = create_streaming_pipeline();

        assert!(backend.inject_sample(DEPTH_CAMERA, depth_key(), 0.0));
        assert!(pipeline.poll_for_frameset().unwrap().is_none());
        assert!(backend.inject_sample(DEPTH_CAMERA, color_key(), 0.0));

        let frameset = pipeline.wait_for_frameset(Duration::from_millis(100)).unwrap();
        assert_eq!(frameset.len(), 2);
        let depth = frameset.depth_frame().expect("frameset should carry depth");
        let color = frameset.color_frame().expect("frameset should carry color");
        assert_eq!((depth.profile.width, depth.profile.height), (640, 480));
        assert_eq!((color.profile.width, color.profile.height), (1280, 720));

        // A lone depth sample 33ms later yields nothing until color catches up
        assert!(backend.inject_sample(DEPTH_CAMERA, depth_key(), 33.0));
        assert!(pipeline.poll_for_frameset().unwrap().is_none());
        assert!(backend.inject_sample(DEPTH_CAMERA, color_key(), 33.0));

        let next = pipeline.poll_for_frameset().unwrap().expect("second frameset");
        assert!((next.timestamp_ms() - 33.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_samples_outside_tolerance_do_not_match() {
        let (backend, pipeline) = create_streaming_pipeline();

        // Tolerance is half the 30fps frame interval (~16.7ms)
        backend.inject_sample(DEPTH_CAMERA, depth_key(), 0.0);
        backend.inject_sample(DEPTH_CAMERA, color_key(), 25.0);
        assert!(pipeline.poll_for_frameset().unwrap().is_none());

        // A newer depth sample supersedes the stale one and matches
        backend.inject_sample(DEPTH_CAMERA, depth_key(), 33.0);
        let frameset = pipeline.poll_for_frameset().unwrap().expect("frameset");
        assert_eq!(frameset.len(), 2);

        let stats = pipeline.delivery_stats();
        assert_eq!(stats.samples_received, 3);
        assert_eq!(stats.samples_superseded, 1);
    }

    #[test]
    fn test_unconsumed_frameset_is_dropped_for_newer() {
        let (backend, pipeline) = create_streaming_pipeline();

        for timestamp in [0.0, 33.0] {
            backend.inject_sample(DEPTH_CAMERA, depth_key(), timestamp);
            backend.inject_sample(DEPTH_CAMERA, color_key(), timestamp);
        }

        let frameset = pipeline.wait_for_frameset(Duration::from_millis(100)).unwrap();
        assert!((frameset.timestamp_ms() - 33.0).abs() < f64::EPSILON);
        assert!(pipeline.poll_for_frameset().unwrap().is_none());

        let stats = pipeline.delivery_stats();
        assert_eq!(stats.framesets_published, 2);
        assert_eq!(stats.framesets_dropped, 1);
        assert_eq!(stats.framesets_consumed, 1);
    }

    #[test]
    fn test_frames_share_sample_buffers() {
        let (backend, pipeline) = create_streaming_pipeline();
        let payload: Arc<[u8]> = Arc::from(vec![7u8; 16]);

        backend.inject_sample_with_data(DEPTH_CAMERA, depth_key(), 0.0, payload.clone());
        backend.inject_sample(DEPTH_CAMERA, color_key(), 0.0);

        let frameset = pipeline.poll_for_frameset().unwrap().expect("frameset");
        let depth = frameset.get(depth_key()).expect("depth frame");
        assert!(Arc::ptr_eq(&depth.data, &payload));
    }

    #[test]
    #[serial]
    fn test_wait_times_out_without_data() {
        let (_backend, pipeline) = create_streaming_pipeline();
        let timeout = Duration::from_millis(100);

        let started = Instant::now();
        let result = pipeline.wait_for_frameset(timeout);
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(PipelineError::Timeout { timeout_ms: 100 })));
        assert!(elapsed >= timeout, "Returned early after {:?}", elapsed);
        assert!(
            elapsed < timeout + Duration::from_millis(250),
            "Timeout overshot: {:?}",
            elapsed
        );
    }

    #[test]
    #[serial]
    fn test_stop_unblocks_waiter() {
        let (_backend, pipeline) = create_streaming_pipeline();

        let waiter = {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let result = pipeline.wait_for_frameset(Duration::from_secs(5));
                (result, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        pipeline.stop();

        let (result, elapsed) = waiter.join().expect("waiter thread panicked");
        assert!(matches!(result, Err(PipelineError::PipelineStopped)));
        assert!(elapsed < Duration::from_secs(1), "Waiter took {:?}", elapsed);
    }

    #[test]
    #[serial]
    fn test_wait_without_deadline_receives_injected_frameset() {
        let (backend, pipeline) = create_streaming_pipeline();

        let waiter = {
            let pipeline = pipeline.clone();
            thread::spawn(move || pipeline.wait_for_frameset(Duration::MAX))
        };

        thread::sleep(Duration::from_millis(50));
        backend.inject_sample(DEPTH_CAMERA, depth_key(), 0.0);
        backend.inject_sample(DEPTH_CAMERA, color_key(), 0.0);

        let frameset = waiter
            .join()
            .expect("waiter thread panicked")
            .expect("waiter should receive the frameset");
        assert_eq!(frameset.len(), 2);
        pipeline.stop();
    }

    #[test]
    #[serial]
    fn test_concurrent_consumers_share_no_frameset() {
        let (backend, pipeline) = create_streaming_pipeline();

        let waiter = {
            let pipeline = pipeline.clone();
            thread::spawn(move || pipeline.wait_for_frameset(Duration::from_millis(300)))
        };
        let poller = {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_millis(300);
                while Instant::now() < deadline {
                    if let Some(frameset) = pipeline.poll_for_frameset().unwrap() {
                        return Some(frameset);
                    }
                    thread::yield_now();
                }
                None
            })
        };

        thread::sleep(Duration::from_millis(20));
        backend.inject_sample(DEPTH_CAMERA, depth_key(), 0.0);
        backend.inject_sample(DEPTH_CAMERA, color_key(), 0.0);

        let waited = waiter.join().expect("waiter thread panicked");
        let polled = poller.join().expect("poller thread panicked");
        assert_eq!(
            usize::from(waited.is_ok()) + usize::from(polled.is_some()),
            1,
            "Exactly one consumer must claim the frameset"
        );
        let stats = pipeline.delivery_stats();
        assert_eq!(stats.framesets_published, 1);
        assert_eq!(stats.framesets_consumed, 1);
        pipeline.stop();
    }

    #[test]
    fn test_retrieval_when_not_streaming() {
        let (_backend, pipeline) = create_streaming_pipeline();
        pipeline.stop();

        assert!(matches!(
            pipeline.poll_for_frameset(),
            Err(PipelineError::PipelineStopped)
        ));
        assert!(matches!(
            pipeline.wait_for_frameset(Duration::from_millis(10)),
            Err(PipelineError::PipelineStopped)
        ));
    }

    #[test]
    fn test_previous_session_samples_are_discarded() {
        let (backend, pipeline) = create_streaming_pipeline();

        backend.inject_sample(DEPTH_CAMERA, depth_key(), 0.0);
        pipeline.stop();
        assert!(
            !backend.inject_sample(DEPTH_CAMERA, depth_key(), 10.0),
            "Released streams must stop delivering"
        );

        pipeline.start().unwrap();
        backend.inject_sample(DEPTH_CAMERA, color_key(), 0.0);
        assert!(
            pipeline.poll_for_frameset().unwrap().is_none(),
            "Depth sample from the previous session must not complete a frameset"
        );
    }

    #[test]
    #[serial]
    fn test_free_running_backend_delivers_framesets() {
        let backend = Arc::new(
            SimulatedBackend::new(SimulatedBackend::default_catalog()).with_free_running(true),
        );
        let pipeline = Pipeline::new(backend.clone());
        pipeline.enable_stream(StreamRequest::any(StreamKind::Depth)).unwrap();
        pipeline.enable_stream(StreamRequest::any(StreamKind::Color)).unwrap();
        pipeline.start().unwrap();

        for _ in 0..3 {
            let frameset = pipeline
                .wait_for_frameset(Duration::from_secs(2))
                .expect("free-running streams should produce framesets");
            assert_eq!(frameset.len(), 2);
        }

        pipeline.stop();
        assert_eq!(backend.registered_stream_count(), 0);
    }
}
