//! Gather/scatter copies between segment lists and flat buffers

/// Total length of a segment list
pub fn total_len(segments: &[&[u8]]) -> usize {
    segments.iter().map(|s| s.len()).sum()
}

/// Copies `segments` back to back into `dst`
///
/// Copies at most `dst.len()` bytes and returns the count copied.
pub fn gather(segments: &[&[u8]], dst: &mut [u8]) -> usize {
    let mut copied = 0;
    for segment in segments {
        let room = dst.len() - copied;
        if room == 0 {
            break;
        }
        let n = segment.len().min(room);
        dst[copied..copied + n].copy_from_slice(&segment[..n]);
        copied += n;
    }
    copied
}

/// Spreads `src` across `segments` in order
///
/// Stops when either side runs out and returns the count copied.
pub fn scatter(src: &[u8], segments: &mut [&mut [u8]]) -> usize {
    let mut copied = 0;
    for segment in segments.iter_mut() {
        let left = src.len() - copied;
        if left == 0 {
            break;
        }
        let n = segment.len().min(left);
        segment[..n].copy_from_slice(&src[copied..copied + n]);
        copied += n;
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_concatenates() {
        let mut dst = [0u8; 8];
        let copied = gather(&[b"ab", b"", b"cde"], &mut dst);
        assert_eq!(copied, 5);
        assert_eq!(&dst[..5], b"abcde");
    }

    #[test]
    fn test_gather_truncates_to_destination() {
        let mut dst = [0u8; 3];
        assert_eq!(gather(&[b"ab", b"cd"], &mut dst), 3);
        assert_eq!(&dst, b"abc");
    }

    #[test]
    fn test_scatter_fills_in_order() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 4];
        let copied = scatter(b"hello", &mut [&mut a[..], &mut b[..]]);
        assert_eq!(copied, 5);
        assert_eq!(&a, b"he");
        assert_eq!(&b[..3], b"llo");
        assert_eq!(b[3], 0);
    }

    #[test]
    fn test_total_len() {
        assert_eq!(total_len(&[b"abc", b"de"]), 5);
        assert_eq!(total_len(&[]), 0);
    }
}
