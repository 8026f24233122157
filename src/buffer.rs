//! Rolling multi-channel sample buffer.
//!
//! Rows are time (oldest first), columns are channels in [`ChannelMap`]
//! column order. The array is allocated once and only ever rolled or
//! overwritten in place.

use ndarray::{s, Array2, ArrayView2, Axis};

use crate::signal::{ChannelMap, Samples};

#[derive(Debug, Clone)]
pub struct SampleBuffer {
    data: Array2<f64>,
}

impl SampleBuffer {
    /// Zero-filled buffer of `height` samples by `width` channels.
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            data: Array2::zeros((height, width)),
        }
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Append decoded samples, dropping the oldest rows.
    ///
    /// When the batch is at least as tall as the buffer, the buffer is
    /// replaced by the newest `height` rows of the batch.
    pub fn push(&mut self, samples: &Samples, map: &ChannelMap) {
        let height = self.height();
        let incoming = samples.len();
        if incoming == 0 || height == 0 {
            return;
        }

        let take = incoming.min(height);
        let src = incoming - take;
        let dst = height - take;

        if take < height {
            let kept = self.data.slice(s![take.., ..]).to_owned();
            self.data.slice_mut(s![..dst, ..]).assign(&kept);
        }

        let de_cols = map.differential_columns();
        if !de_cols.is_empty() {
            self.data
                .slice_mut(s![dst.., de_cols])
                .assign(&samples.differential.slice(s![src.., ..]));
        }

        let se_cols = map.single_ended_columns();
        if !se_cols.is_empty() {
            self.data
                .slice_mut(s![dst.., se_cols])
                .assign(&samples.single_ended.slice(s![src.., ..]));
        }
    }

    /// Copy of the newest `n` rows restricted to `channels`, in the order given.
    ///
    /// `n` is clamped to the buffer height; callers check channel indices.
    pub fn latest(&self, n: usize, channels: &[usize]) -> Array2<f64> {
        let height = self.height();
        let n = n.min(height);
        self.data
            .slice(s![height - n.., ..])
            .select(Axis(1), channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn one_channel(values: &[f64]) -> Samples {
        Samples {
            differential: Array2::from_shape_vec((values.len(), 1), values.to_vec()).unwrap(),
            single_ended: Array2::zeros((values.len(), 0)),
        }
    }

    #[test]
    fn single_ended_only_fills_every_column() {
        let map = ChannelMap::from_masks(0, 0b101);
        assert_eq!(map.differential_count(), 0);
        let mut buf = SampleBuffer::new(3, map.total());
        let samples = Samples {
            differential: Array2::zeros((2, 0)),
            single_ended: array![[0.25, 0.5], [0.75, 1.0]],
        };
        buf.push(&samples, &map);
        assert_eq!(buf.view(), array![[0.0, 0.0], [0.25, 0.5], [0.75, 1.0]]);
    }

    #[test]
    fn short_batch_rolls_and_appends() {
        let map = ChannelMap::from_masks(0b1, 0);
        let mut buf = SampleBuffer::new(4, 1);
        buf.push(&one_channel(&[10.0, 20.0, 30.0, 40.0]), &map);
        let before = buf.view().to_owned();

        buf.push(&one_channel(&[1.0, 2.0]), &map);

        let col: Vec<f64> = buf.view().column(0).to_vec();
        assert_eq!(&col[2..], &[1.0, 2.0]);
        // The two surviving rows are the newest two from before.
        assert_eq!(&col[..2], &before.column(0).to_vec()[2..]);
    }

    #[test]
    fn short_batch_into_fresh_buffer_leaves_leading_rows() {
        let map = ChannelMap::from_masks(0b1, 0);
        let mut buf = SampleBuffer::new(4, 1);
        buf.push(&one_channel(&[1.0, 2.0]), &map);
        assert_eq!(buf.view().column(0).to_vec(), vec![0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn tall_batch_overwrites_everything() {
        let map = ChannelMap::from_masks(0b1, 0);
        let mut buf = SampleBuffer::new(3, 1);
        buf.push(&one_channel(&[7.0, 8.0, 9.0]), &map);
        buf.push(&one_channel(&[1.0, 2.0, 3.0, 4.0, 5.0]), &map);
        assert_eq!(buf.view().column(0).to_vec(), vec![3.0, 4.0, 5.0]);

        buf.push(&one_channel(&[6.0, 7.0, 8.0]), &map);
        assert_eq!(buf.view().column(0).to_vec(), vec![6.0, 7.0, 8.0]);
    }

    #[test]
    fn differential_and_single_ended_columns() {
        let map = ChannelMap::from_masks(0b11, 0b100);
        let mut buf = SampleBuffer::new(3, map.total());
        let samples = Samples {
            differential: array![[1.0, 2.0], [3.0, 4.0]],
            single_ended: array![[0.5], [0.25]],
        };
        buf.push(&samples, &map);
        assert_eq!(
            buf.view(),
            array![[0.0, 0.0, 0.0], [1.0, 2.0, 0.5], [3.0, 4.0, 0.25]]
        );
    }

    #[test]
    fn latest_selects_rows_and_channels() {
        let map = ChannelMap::from_masks(0b11, 0b1);
        let mut buf = SampleBuffer::new(4, 3);
        let samples = Samples {
            differential: array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]],
            single_ended: array![[9.0], [10.0], [11.0], [12.0]],
        };
        buf.push(&samples, &map);

        let window = buf.latest(2, &[2, 0]);
        assert_eq!(window, array![[11.0, 5.0], [12.0, 7.0]]);
        assert_eq!(buf.latest(100, &[1]).nrows(), 4);
    }
}
