//! Frame combination for stacked exposures.

use gcam_camera::ImageFrame;

use crate::error::{SequencerError, SequencerResult};

/// Per-pixel median across equally sized frames.
///
/// The median rejects cosmic-ray hits that a mean would smear into the
/// stack. With an even count the two middle values are averaged, computed
/// in u32 so 65535 + 65535 cannot wrap.
pub fn median_combine(frames: &[ImageFrame]) -> SequencerResult<ImageFrame> {
    let first = frames
        .first()
        .ok_or_else(|| SequencerError::InvalidRequest("cannot combine zero frames".to_string()))?;
    if frames.len() == 1 {
        return Ok(first.clone());
    }
    for frame in &frames[1..] {
        if frame.width != first.width || frame.height != first.height {
            return Err(SequencerError::InvalidRequest(format!(
                "frame size mismatch in stack: {}x{} vs {}x{}",
                frame.width, frame.height, first.width, first.height
            )));
        }
    }

    let count = frames.len();
    let mut pixels = Vec::with_capacity(first.pixels.len());
    let mut column = vec![0u16; count];
    for i in 0..first.pixels.len() {
        for (j, frame) in frames.iter().enumerate() {
            column[j] = frame.pixels[i];
        }
        column.sort_unstable();
        let mid = count / 2;
        let median = if count % 2 == 1 {
            column[mid]
        } else {
            ((column[mid - 1] as u32 + column[mid] as u32) / 2) as u16
        };
        pixels.push(median);
    }

    Ok(ImageFrame::new(first.width, first.height, pixels))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pixels: Vec<u16>) -> ImageFrame {
        ImageFrame::new(2, 2, pixels)
    }

    #[test]
    fn test_odd_stack_takes_middle_value() {
        let combined = median_combine(&[
            frame(vec![10, 500, 7, 65535]),
            frame(vec![30, 100, 9, 65535]),
            frame(vec![20, 300, 8, 0]),
        ])
        .unwrap();
        assert_eq!(
            combined.pixels,
            vec![20, 300, 8, 65535],
            "one outlier per pixel must not survive a 3-frame median"
        );
    }

    #[test]
    fn test_even_stack_averages_the_midpoint() {
        let combined = median_combine(&[
            frame(vec![10, 65535, 0, 4]),
            frame(vec![20, 65535, 0, 4]),
            frame(vec![30, 65535, 0, 4]),
            frame(vec![40, 65535, 0, 4]),
        ])
        .unwrap();
        assert_eq!(combined.pixels[0], 25);
        assert_eq!(combined.pixels[1], 65535, "full-scale pairs must not wrap");
    }

    #[test]
    fn test_single_frame_passes_through() {
        let single = frame(vec![1, 2, 3, 4]);
        let combined = median_combine(std::slice::from_ref(&single)).unwrap();
        assert_eq!(combined, single);
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let err = median_combine(&[
            frame(vec![1, 2, 3, 4]),
            ImageFrame::new(1, 4, vec![1, 2, 3, 4]),
        ])
        .unwrap_err();
        assert!(matches!(err, SequencerError::InvalidRequest(_)));
    }

    #[test]
    fn test_empty_stack_is_rejected() {
        assert!(median_combine(&[]).is_err());
    }
}
