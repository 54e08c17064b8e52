// src/video/prefetch.rs
//
// Sequential frame delivery with optional decode-ahead on a scoped worker.
// The worker blocks once `capacity` frames are queued and exits as soon as
// the consumer stops listening.

use super::FrameSource;
use anyhow::Result;
use image::RgbImage;
use std::sync::mpsc::sync_channel;
use std::thread;
use tracing::{debug, warn};

/// Reads up to `max_frames` frames from the current position and hands them
/// to `sink` in order until it returns `false`. Read failures end the stream.
/// Returns the number of frames delivered.
pub fn read_frames<S, F>(source: &mut S, max_frames: usize, capacity: usize, mut sink: F) -> Result<usize>
where
    S: FrameSource + ?Sized,
    F: FnMut(RgbImage) -> Result<bool>,
{
    if capacity == 0 {
        let mut delivered = 0;
        while delivered < max_frames {
            let Some(frame) = next_frame(source) else { break };
            delivered += 1;
            if !sink(frame)? {
                break;
            }
        }
        return Ok(delivered);
    }

    thread::scope(|scope| -> Result<usize> {
        let (tx, rx) = sync_channel::<RgbImage>(capacity);

        scope.spawn(move || {
            for _ in 0..max_frames {
                let Some(frame) = next_frame(source) else { break };
                if tx.send(frame).is_err() {
                    debug!("Frame consumer gone, stopping decode worker");
                    break;
                }
            }
        });

        let mut delivered = 0;
        for frame in rx.iter() {
            delivered += 1;
            if !sink(frame)? {
                break;
            }
        }
        // Dropping the receiver here unblocks a worker waiting on a full queue
        drop(rx);
        Ok(delivered)
    })
}

fn next_frame<S: FrameSource + ?Sized>(source: &mut S) -> Option<RgbImage> {
    match source.read_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Frame decode failed, ending read: {:#}", e);
            None
        }
    }
}
