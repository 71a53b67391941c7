//! Frame sources: a single image file, or a live V4L2 camera.

use crate::engine::EngineHandle;
use anyhow::{Context, Result};
use mira_core::RecognitionResult;
use mira_hw::{Camera, CameraError, Frame};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Consecutive dequeue failures after which the capture thread gives up.
const MAX_CAPTURE_FAILURES: u32 = 10;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i64 = 2;

/// Camera settings for [`run_camera`].
#[derive(Debug, Clone)]
pub struct CameraOptions {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub warmup_frames: usize,
}

/// Recognize the faces in one image file and print them.
///
/// With `output`, a copy of the image with every face boxed is written there.
pub async fn run_image(
    engine: &EngineHandle,
    path: &Path,
    json: bool,
    output: Option<&Path>,
) -> Result<()> {
    let image = image::open(path)
        .with_context(|| format!("reading image {}", path.display()))?
        .to_rgb8();
    tracing::debug!(path = %path.display(), width = image.width(), height = image.height(), "image loaded");

    let mut canvas = output.map(|_| image.clone());
    let results = engine
        .recognize(image)
        .await
        .with_context(|| format!("processing {}", path.display()))?;
    println!("{}", render(&results, None, json));

    if let (Some(out), Some(canvas)) = (output, canvas.as_mut()) {
        annotate(canvas, &results);
        canvas
            .save(out)
            .with_context(|| format!("writing annotated image {}", out.display()))?;
        tracing::info!(path = %out.display(), faces = results.len(), "annotated image written");
    }
    Ok(())
}

/// Stream frames from the camera until Ctrl-C or the capture ends.
///
/// A frame that fails or times out is logged and skipped. Frames arriving
/// while the engine is busy are dropped so output tracks the live scene.
pub async fn run_camera(engine: &EngineHandle, options: CameraOptions, json: bool) -> Result<()> {
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(1);
    let (ready_tx, ready_rx) = oneshot::channel();
    let stop = Arc::new(AtomicBool::new(false));

    let capture_stop = Arc::clone(&stop);
    std::thread::Builder::new()
        .name("mira-capture".into())
        .spawn(move || capture_loop(options, frame_tx, ready_tx, capture_stop))
        .context("spawning capture thread")?;

    ready_rx
        .await
        .context("capture thread exited before the camera opened")?
        .context("opening camera")?;
    tracing::info!("camera ready; press Ctrl-C to stop");

    let processed = process_frames(engine, &mut frame_rx, tokio::signal::ctrl_c(), json).await;
    tracing::info!(frames = processed, "camera session ended");

    stop.store(true, Ordering::Relaxed);
    Ok(())
}

/// Recognize frames from `frames` until `stop` resolves or the sender hangs up.
///
/// `stop` is also raced against the frame in flight, so a slow or hung engine
/// never delays shutdown. Returns the number of frames that were recognized.
async fn process_frames<F: Future>(
    engine: &EngineHandle,
    frames: &mut mpsc::Receiver<Frame>,
    stop: F,
    json: bool,
) -> usize {
    tokio::pin!(stop);
    let mut processed = 0;

    loop {
        let frame = tokio::select! {
            _ = &mut stop => {
                tracing::info!("interrupted");
                break;
            }
            next = frames.recv() => match next {
                Some(frame) => frame,
                None => {
                    tracing::warn!("capture stopped");
                    break;
                }
            },
        };

        let sequence = frame.sequence;
        tokio::select! {
            _ = &mut stop => {
                tracing::info!(sequence, "interrupted while a frame was in flight");
                break;
            }
            outcome = engine.recognize(frame.image) => match outcome {
                Ok(results) => {
                    processed += 1;
                    println!("{}", render(&results, Some(sequence), json));
                }
                Err(e) => tracing::warn!(sequence, error = %e, "skipping frame"),
            },
        }
    }

    processed
}

fn capture_loop(
    options: CameraOptions,
    frames: mpsc::Sender<Frame>,
    ready: oneshot::Sender<Result<(), CameraError>>,
    stop: Arc<AtomicBool>,
) {
    let camera = match Camera::open(&options.device, options.width, options.height) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut stream = match camera.stream() {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    tracing::debug!(
        width = camera.width,
        height = camera.height,
        format = ?camera.pixel_format(),
        "streaming"
    );

    // Auto-exposure needs a few frames to settle.
    if options.warmup_frames > 0 {
        tracing::info!(count = options.warmup_frames, "discarding warmup frames");
        for _ in 0..options.warmup_frames {
            let _ = stream.next_frame();
        }
    }
    if ready.send(Ok(())).is_err() {
        return;
    }

    let mut failures = 0;
    while !stop.load(Ordering::Relaxed) {
        let frame = match stream.next_frame() {
            Ok(frame) => {
                failures = 0;
                frame
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, "frame capture failed");
                if failures >= MAX_CAPTURE_FAILURES {
                    tracing::error!("too many consecutive capture failures");
                    return;
                }
                continue;
            }
        };

        if frame.is_dark {
            tracing::debug!(sequence = frame.sequence, "dark frame skipped");
            continue;
        }

        match frames.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::trace!(sequence = frame.sequence, "engine busy; frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

/// Box every face on `image`: green for known identities, red for unknown.
///
/// Boxes are 2 px wide, drawn inward from the reported rectangle.
pub fn annotate(image: &mut RgbImage, results: &[RecognitionResult]) {
    for result in results {
        let color = if result.is_known() { KNOWN_COLOR } else { UNKNOWN_COLOR };
        let (x, y) = (result.bbox.x.round() as i32, result.bbox.y.round() as i32);
        let (w, h) = (result.bbox.width.round() as i64, result.bbox.height.round() as i64);
        for inset in 0..BOX_THICKNESS {
            let (w, h) = (w - 2 * inset, h - 2 * inset);
            if w < 1 || h < 1 {
                break;
            }
            let rect = Rect::at(x + inset as i32, y + inset as i32).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, rect, color);
        }
    }
}

/// Format one frame's results as text lines or a single JSON document.
pub fn render(results: &[RecognitionResult], sequence: Option<u32>, json: bool) -> String {
    if json {
        let value = match sequence {
            Some(frame) => serde_json::json!({ "frame": frame, "faces": results }),
            None => serde_json::json!({ "faces": results }),
        };
        return value.to_string();
    }

    let prefix = sequence.map(|s| format!("[frame {s}] ")).unwrap_or_default();
    if results.is_empty() {
        return format!("{prefix}no faces");
    }
    results
        .iter()
        .map(|r| {
            let distance = r
                .match_distance
                .map(|d| format!("{d:.3}"))
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{prefix}{} distance={distance} confidence={:.2} box=({:.0}, {:.0}, {:.0}x{:.0})",
                r.label, r.detection_confidence, r.bbox.x, r.bbox.y, r.bbox.width, r.bbox.height
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::engine;
    use mira_core::{BoundingBox, UNKNOWN_LABEL};
    use std::time::Duration;

    fn results() -> Vec<RecognitionResult> {
        vec![
            RecognitionResult {
                bbox: BoundingBox::new(10.0, 20.0, 40.0, 50.0),
                label: "Alice".into(),
                match_distance: Some(0.1234),
                detection_confidence: 0.95,
            },
            RecognitionResult {
                bbox: BoundingBox::new(100.0, 20.0, 30.0, 30.0),
                label: UNKNOWN_LABEL.into(),
                match_distance: None,
                detection_confidence: 0.8,
            },
        ]
    }

    #[test]
    fn test_render_text() {
        let text = render(&results(), Some(7), false);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            "[frame 7] Alice distance=0.123 confidence=0.95 box=(10, 20, 40x50)"
        );
        assert!(lines[1].starts_with("[frame 7] unknown distance=-"));
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render(&[], None, false), "no faces");
    }

    #[test]
    fn test_render_json() {
        let value: serde_json::Value = serde_json::from_str(&render(&results(), Some(3), true)).unwrap();
        assert_eq!(value["frame"], 3);
        assert_eq!(value["faces"][0]["label"], "Alice");
        assert!(value["faces"][1]["match_distance"].is_null());
    }

    #[test]
    fn test_annotate_colors_known_and_unknown() {
        let mut image = RgbImage::new(160, 100);
        annotate(&mut image, &results());

        // Alice at (10, 20, 40x50): both border rows are green.
        assert_eq!(*image.get_pixel(10, 20), KNOWN_COLOR);
        assert_eq!(*image.get_pixel(11, 21), KNOWN_COLOR);
        assert_eq!(*image.get_pixel(49, 69), KNOWN_COLOR);
        // Unknown face at (100, 20, 30x30) is red.
        assert_eq!(*image.get_pixel(100, 35), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(129, 49), UNKNOWN_COLOR);
        // Interiors and the background are untouched.
        assert_eq!(*image.get_pixel(30, 45), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(115, 35), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_annotate_tiny_box() {
        let mut image = RgbImage::new(8, 8);
        let tiny = RecognitionResult {
            bbox: BoundingBox::new(3.0, 3.0, 1.0, 1.0),
            label: UNKNOWN_LABEL.into(),
            match_distance: None,
            detection_confidence: 0.5,
        };
        annotate(&mut image, &[tiny]);
        assert_eq!(*image.get_pixel(3, 3), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(4, 4), Rgb([0, 0, 0]));
    }

    fn frame(sequence: u32) -> Frame {
        Frame {
            image: RgbImage::from_pixel(8, 8, Rgb([250, 0, 0])),
            sequence,
            is_dark: false,
        }
    }

    #[tokio::test]
    async fn test_process_frames_until_sender_closes() {
        let handle = engine(Duration::ZERO, false, Some(Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(frame(1)).await.unwrap();
        tx.send(frame(2)).await.unwrap();
        drop(tx);

        let processed = process_frames(&handle, &mut rx, std::future::pending::<()>(), false).await;
        assert_eq!(processed, 2);
    }

    #[tokio::test]
    async fn test_stop_interrupts_frame_in_flight() {
        // The engine would hold this frame for 30 s and never time out.
        let handle = engine(Duration::from_secs(30), false, None);
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(frame(1)).await.unwrap();

        let stop = tokio::time::sleep(Duration::from_millis(50));
        let processed = tokio::time::timeout(
            Duration::from_secs(5),
            process_frames(&handle, &mut rx, stop, false),
        )
        .await
        .expect("stop must end processing while the engine is busy");
        assert_eq!(processed, 0);
    }
}
