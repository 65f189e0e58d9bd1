//! Window geometry for 2-D pooling over NHWC arrays.

use crate::error::{Error, Result};

/// How the input border is padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// No padding; windows must fit entirely inside the input.
    Valid,
    /// Pad so the output has `ceil(in / stride)` positions per axis.
    Same,
    /// Pad every border by the same amount.
    Explicit(usize),
}

/// Padding applied to each border, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadInfo {
    /// Rows above.
    pub top: usize,
    /// Columns left.
    pub left: usize,
    /// Rows below.
    pub bottom: usize,
    /// Columns right.
    pub right: usize,
}

/// Resolved geometry of a pooling window sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2DInfo {
    /// Images per batch.
    pub batch_size: usize,
    /// Input rows.
    pub in_height: usize,
    /// Input columns.
    pub in_width: usize,
    /// Input channels.
    pub in_channels: usize,
    /// Output rows.
    pub out_height: usize,
    /// Output columns.
    pub out_width: usize,
    /// Output channels; equal to `in_channels` for pooling.
    pub out_channels: usize,
    /// Row step between windows.
    pub stride_height: usize,
    /// Column step between windows.
    pub stride_width: usize,
    /// Window rows.
    pub filter_height: usize,
    /// Window columns.
    pub filter_width: usize,
    /// Border padding.
    pub pad: PadInfo,
}

impl Conv2DInfo {
    /// `[batch, in_height, in_width, in_channels]`
    #[must_use]
    pub const fn in_shape(&self) -> [usize; 4] {
        [self.batch_size, self.in_height, self.in_width, self.in_channels]
    }

    /// `[batch, out_height, out_width, out_channels]`
    #[must_use]
    pub const fn out_shape(&self) -> [usize; 4] {
        [self.batch_size, self.out_height, self.out_width, self.out_channels]
    }

    /// Input rows covered by output row `yr`, clipped to the input.
    ///
    /// Returned as a half-open range of input coordinates.
    #[must_use]
    pub fn rows(&self, yr: usize) -> core::ops::Range<usize> {
        window(yr, self.stride_height, self.filter_height, self.pad.top, self.in_height)
    }

    /// Input columns covered by output column `yc`, clipped to the input.
    #[must_use]
    pub fn cols(&self, yc: usize) -> core::ops::Range<usize> {
        window(yc, self.stride_width, self.filter_width, self.pad.left, self.in_width)
    }

    /// Flat NHWC offset of an input element.
    #[must_use]
    pub const fn in_offset(&self, b: usize, r: usize, c: usize, d: usize) -> usize {
        ((b * self.in_height + r) * self.in_width + c) * self.in_channels + d
    }

    /// Flat NHWC offset of an output element.
    #[must_use]
    pub const fn out_offset(&self, b: usize, r: usize, c: usize, d: usize) -> usize {
        ((b * self.out_height + r) * self.out_width + c) * self.out_channels + d
    }
}

fn window(y: usize, stride: usize, filter: usize, pad: usize, len: usize) -> core::ops::Range<usize> {
    let start = (y * stride).saturating_sub(pad);
    let end = (y * stride + filter).saturating_sub(pad).min(len);
    start..end.max(start)
}

fn out_and_pad(input: usize, filter: usize, stride: usize, padding: Padding) -> Option<(usize, usize, usize)> {
    match padding {
        Padding::Valid => {
            if input < filter {
                return None;
            }
            Some(((input - filter) / stride + 1, 0, 0))
        }
        Padding::Same => {
            let out = input.div_ceil(stride);
            let total = ((out - 1) * stride + filter).saturating_sub(input);
            Some((out, total / 2, total - total / 2))
        }
        Padding::Explicit(p) => {
            if input + 2 * p < filter {
                return None;
            }
            Some(((input + 2 * p - filter) / stride + 1, p, p))
        }
    }
}

/// Geometry of a pooling pass over an NHWC input.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if the input is not rank 4, the filter or strides
/// are zero, or the filter does not fit the (padded) input.
pub fn compute_pool2d_info(
    in_shape: &[usize],
    filter: [usize; 2],
    strides: [usize; 2],
    padding: Padding,
) -> Result<Conv2DInfo> {
    let &[batch_size, in_height, in_width, in_channels] = in_shape else {
        return Err(Error::shape("pool2d", in_shape, &filter));
    };
    if filter.contains(&0) || strides.contains(&0) || in_height == 0 || in_width == 0 {
        return Err(Error::shape("pool2d", in_shape, &filter));
    }
    let (out_height, top, bottom) = out_and_pad(in_height, filter[0], strides[0], padding)
        .ok_or_else(|| Error::shape("pool2d", in_shape, &filter))?;
    let (out_width, left, right) = out_and_pad(in_width, filter[1], strides[1], padding)
        .ok_or_else(|| Error::shape("pool2d", in_shape, &filter))?;
    Ok(Conv2DInfo {
        batch_size,
        in_height,
        in_width,
        in_channels,
        out_height,
        out_width,
        out_channels: in_channels,
        stride_height: strides[0],
        stride_width: strides[1],
        filter_height: filter[0],
        filter_width: filter[1],
        pad: PadInfo {
            top,
            left,
            bottom,
            right,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_keeps_ceil_size() {
        let info = compute_pool2d_info(&[1, 5, 5, 2], [2, 2], [2, 2], Padding::Same).unwrap();
        assert_eq!(info.out_shape(), [1, 3, 3, 2]);
        assert_eq!(info.pad, PadInfo { top: 0, left: 0, bottom: 1, right: 1 });
        assert_eq!(info.rows(2), 4..5);
    }

    #[test]
    fn valid_padding_rejects_oversized_filter() {
        assert!(compute_pool2d_info(&[1, 2, 2, 1], [3, 3], [1, 1], Padding::Valid).is_err());
        let info = compute_pool2d_info(&[1, 4, 4, 1], [2, 2], [2, 2], Padding::Valid).unwrap();
        assert_eq!(info.out_shape(), [1, 2, 2, 1]);
    }

    #[test]
    fn explicit_padding_clips_windows() {
        let info = compute_pool2d_info(&[1, 3, 3, 1], [3, 3], [1, 1], Padding::Explicit(1)).unwrap();
        assert_eq!(info.out_shape(), [1, 3, 3, 1]);
        assert_eq!(info.rows(0), 0..2);
        assert_eq!(info.cols(2), 1..3);
    }
}
