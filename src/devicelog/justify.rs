//! Line justification for capture-file marker offsets.
//!
//! Markers are recorded mid-stream and may land inside a line. Justification
//! snaps a start marker backward and an end marker forward to the nearest
//! line boundary so the content between a start/end pair is always whole
//! lines. Both functions are idempotent: an offset already sitting on a line
//! boundary is returned unchanged.

use memchr::{memchr, memrchr};

/// Pulls a start marker back to the nearest preceding line boundary, or to
/// the start of the file.
pub(crate) fn justify_start(bytes: &[u8], offset: usize) -> usize {
    let clamped = offset.min(bytes.len());
    if clamped == 0 || follows_newline(bytes, clamped) {
        return clamped;
    }
    bytes
        .get(..clamped)
        .and_then(|prefix| memrchr(b'\n', prefix))
        .map_or(0, |newline| newline + 1)
}

/// Pushes an end marker forward to the nearest following line boundary, or
/// to the end of the file.
pub(crate) fn justify_end(bytes: &[u8], offset: usize) -> usize {
    let clamped = offset.min(bytes.len());
    if clamped == 0 || clamped == bytes.len() || follows_newline(bytes, clamped) {
        return clamped;
    }
    bytes
        .get(clamped..)
        .and_then(|suffix| memchr(b'\n', suffix))
        .map_or(bytes.len(), |newline| clamped + newline + 1)
}

fn follows_newline(bytes: &[u8], offset: usize) -> bool {
    bytes.get(offset.wrapping_sub(1)) == Some(&b'\n')
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{justify_end, justify_start};

    const LOG: &[u8] = b"first line\nsecond line\nthird";

    #[rstest]
    #[case(0, 0)]
    #[case(4, 0)] // inside "first line"
    #[case(11, 11)] // already at the start of "second line"
    #[case(15, 11)] // inside "second line"
    #[case(25, 23)] // inside the unterminated final line
    fn start_markers_are_pulled_backward(#[case] offset: usize, #[case] expected: usize) {
        assert_eq!(justify_start(LOG, offset), expected);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(4, 11)] // inside "first line"
    #[case(11, 11)] // already on a boundary
    #[case(15, 23)] // inside "second line"
    #[case(25, LOG.len())] // unterminated final line extends to file end
    fn end_markers_are_pushed_forward(#[case] offset: usize, #[case] expected: usize) {
        assert_eq!(justify_end(LOG, offset), expected);
    }

    #[rstest]
    fn justification_is_idempotent_over_every_offset() {
        for offset in 0..=LOG.len() {
            let start = justify_start(LOG, offset);
            assert_eq!(justify_start(LOG, start), start);
            let end = justify_end(LOG, offset);
            assert_eq!(justify_end(LOG, end), end);
        }
    }

    #[rstest]
    fn offsets_beyond_the_file_clamp_to_its_length() {
        assert_eq!(justify_start(LOG, 9999), 23);
        assert_eq!(justify_end(LOG, 9999), LOG.len());
    }

    #[rstest]
    fn empty_file_justifies_everything_to_zero() {
        assert_eq!(justify_start(b"", 5), 0);
        assert_eq!(justify_end(b"", 5), 0);
    }
}
