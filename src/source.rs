//! Common capability set of every signal source.

use std::fmt;

use ndarray::Array2;

use crate::errors::Result;

/// Which kind of device sits behind a [`SignalSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    SerialHeadstage,
    BluetoothSleeve,
    Simulated,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::SerialHeadstage => "serial headstage",
            SourceKind::BluetoothSleeve => "bluetooth sleeve",
            SourceKind::Simulated => "simulated",
        };
        f.write_str(name)
    }
}

/// Anything that can deliver windows of `[samples x channels]` data.
///
/// Callers hold a `Box<dyn SignalSource>` and swap implementations freely.
pub trait SignalSource: Send {
    fn kind(&self) -> SourceKind;

    fn connect(&mut self) -> Result<()>;

    /// Newest `num_samples` rows (all when `None`) of the selected columns
    /// (all when `None`).
    fn get_data(
        &mut self,
        num_samples: Option<usize>,
        channels: Option<&[usize]>,
    ) -> Result<Array2<f64>>;

    fn status_text(&self) -> String;

    fn close(&mut self) -> Result<()>;
}
