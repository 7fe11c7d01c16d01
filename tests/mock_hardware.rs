//! Integration tests for mock hardware implementations
//!
//! These tests verify that MockProcessor and MockDisplay correctly implement
//! the capability traits and exhibit realistic behavior.

use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::time::Instant;
use tuning_daq::error::DaqError;
use tuning_daq::hardware::mock::{DisplayCall, MockDisplay, MockProcessor};
use tuning_daq::hardware::{Processor, ProcessorStatus, SampleFormat, StimulusDisplay};

// =============================================================================
// MockProcessor Tests
// =============================================================================

#[tokio::test]
async fn test_mock_processor_lifecycle() {
    let circuit = NamedTempFile::new().unwrap();
    let processor = MockProcessor::new(24414.0625);

    processor
        .load_circuit(circuit.path(), true, true)
        .await
        .unwrap();
    assert_eq!(processor.status().await.unwrap(), ProcessorStatus::READY);
    assert_eq!(processor.sampling_rate().await.unwrap(), 24414.0625);

    processor.set_tag("samples", 146_485.0).await.unwrap();
    assert_eq!(processor.tag("samples").await, Some(146_485.0));

    processor.stop().await.unwrap();
    assert!(processor.is_stopped().await);
    assert!(!processor.status().await.unwrap().is_ready());
}

#[tokio::test]
async fn test_mock_processor_rejects_missing_circuit() {
    let processor = MockProcessor::new(1000.0);
    let result = processor
        .load_circuit(std::path::Path::new("/nonexistent/tuning.rcx"), true, true)
        .await;
    assert!(matches!(result, Err(DaqError::CircuitLoad(_))));
}

#[tokio::test]
async fn test_mock_processor_read_window() {
    let circuit = NamedTempFile::new().unwrap();
    let processor = MockProcessor::new(1000.0);
    processor
        .load_circuit(circuit.path(), true, true)
        .await
        .unwrap();

    let samples = processor
        .read_channel(4, 0, 2500, SampleFormat::F32)
        .await
        .unwrap();
    assert_eq!(samples.len(), 2500);
    assert!(samples.iter().all(|&v| (v - 4.0).abs() <= 0.25 + 1e-6));
}

#[tokio::test]
async fn test_mock_processor_disconnect_injection() {
    let circuit = NamedTempFile::new().unwrap();
    let processor = MockProcessor::new(1000.0).with_disconnect_after(2);
    processor
        .load_circuit(circuit.path(), true, true)
        .await
        .unwrap();

    for _ in 0..2 {
        processor.send_trigger(1).await.unwrap();
        assert!(processor.status().await.unwrap().is_ready());
    }
    processor.send_trigger(1).await.unwrap();
    assert_eq!(processor.status().await.unwrap(), ProcessorStatus(0));
    assert_eq!(processor.trigger_count(), 3);

    // Nothing comes back once the connection is gone
    let samples = processor
        .read_channel(1, 0, 100, SampleFormat::F32)
        .await
        .unwrap();
    assert!(samples.is_empty());
}

// =============================================================================
// MockDisplay Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_mock_display_flip_timing() {
    let display = MockDisplay::with_frame_duration(Duration::from_millis(16));

    let start = Instant::now();
    for _ in 0..10 {
        display.flip().await.unwrap();
    }
    assert_eq!(start.elapsed(), Duration::from_millis(160));
    assert_eq!(display.flip_count().await, 10);
}

#[tokio::test]
async fn test_mock_display_records_calls() {
    let display = MockDisplay::default();

    display.set_orientation(150.0).await.unwrap();
    display.set_contrast(1.0).await.unwrap();
    display.set_phase(0.052).await.unwrap();

    assert_eq!(
        display.calls().await,
        vec![
            DisplayCall::Orientation(150.0),
            DisplayCall::Contrast(1.0),
            DisplayCall::Phase(0.052),
        ]
    );

    display.clear_calls().await;
    assert!(display.calls().await.is_empty());

    display.close().await.unwrap();
    assert!(display.is_closed().await);
}
