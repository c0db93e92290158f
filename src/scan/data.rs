//! Query view over a scan's channels and alignment helpers.
//!
//! [`ScanData`] is a read-only view keyed by channel name. It can be taken at
//! any time; while the scan runs it reflects whatever has been emitted so far.
//!
//! The helpers work on an (x, y) pair of equal-length arrays:
//!
//! - [`peak`]: x and y at the maximum of y
//! - [`com`]: center of mass of y along x
//! - [`cen`]: center and full width at half maximum
//! - [`fwhm`]: full width at half maximum

use std::collections::BTreeMap;

use crate::channel::Channel;

/// Read-only view of a scan's channels.
#[derive(Debug, Clone)]
pub struct ScanData {
    channels: BTreeMap<String, Channel>,
}

impl ScanData {
    pub(crate) fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|channel| (channel.name().to_string(), channel))
                .collect(),
        }
    }

    /// Channel names in alphabetical order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Channel handle
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// All values of a channel
    pub fn get(&self, name: &str) -> Option<Vec<f64>> {
        self.channels.get(name).map(Channel::values)
    }

    /// Number of samples in a channel
    pub fn len_of(&self, name: &str) -> Option<usize> {
        self.channels.get(name).map(Channel::len)
    }

    /// All channels as arrays
    pub fn to_map(&self) -> BTreeMap<String, Vec<f64>> {
        self.channels
            .iter()
            .map(|(name, channel)| (name.clone(), channel.values()))
            .collect()
    }

    fn pair(&self, x: &str, y: &str) -> Option<(Vec<f64>, Vec<f64>)> {
        Some((self.get(x)?, self.get(y)?))
    }

    /// [`peak`] on two channels
    pub fn peak(&self, x: &str, y: &str) -> Option<(f64, f64)> {
        let (x, y) = self.pair(x, y)?;
        peak(&x, &y)
    }

    /// [`com`] on two channels
    pub fn com(&self, x: &str, y: &str) -> Option<f64> {
        let (x, y) = self.pair(x, y)?;
        com(&x, &y)
    }

    /// [`cen`] on two channels
    pub fn cen(&self, x: &str, y: &str) -> Option<(f64, f64)> {
        let (x, y) = self.pair(x, y)?;
        cen(&x, &y)
    }

    /// [`fwhm`] on two channels
    pub fn fwhm(&self, x: &str, y: &str) -> Option<f64> {
        let (x, y) = self.pair(x, y)?;
        fwhm(&x, &y)
    }
}

fn truncated<'a>(x: &'a [f64], y: &'a [f64]) -> Option<(&'a [f64], &'a [f64])> {
    let n = x.len().min(y.len());
    (n > 0).then(|| (&x[..n], &y[..n]))
}

/// Position and value of the maximum of `y`.
pub fn peak(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let (x, y) = truncated(x, y)?;
    let (index, value) = y
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    Some((x[index], value))
}

/// Center of mass `sum(x * y) / sum(y)`; `None` when `sum(y)` is zero.
pub fn com(x: &[f64], y: &[f64]) -> Option<f64> {
    let (x, y) = truncated(x, y)?;
    let weight: f64 = y.iter().sum();
    if weight == 0.0 {
        return None;
    }
    Some(x.iter().zip(y).map(|(xi, yi)| xi * yi).sum::<f64>() / weight)
}

fn crossing(x: &[f64], y: &[f64], a: usize, b: usize, level: f64) -> f64 {
    let dy = y[b] - y[a];
    if dy == 0.0 {
        return x[a];
    }
    x[a] + (level - y[a]) * (x[b] - x[a]) / dy
}

/// Center and full width at half maximum of the peak of `y`.
///
/// Half maximum is taken between the minimum and the maximum of `y`; the
/// crossings are linearly interpolated. A side that never drops below half
/// maximum uses the first/last x.
pub fn cen(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let (x, y) = truncated(x, y)?;
    let (top, max) = y
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    let min = y.iter().copied().fold(f64::INFINITY, f64::min);
    let half = (max + min) / 2.0;

    let left = (0..top)
        .rev()
        .find(|&i| y[i] < half)
        .map_or(x[0], |i| crossing(x, y, i, i + 1, half));
    let right = (top + 1..y.len())
        .find(|&j| y[j] < half)
        .map_or(x[x.len() - 1], |j| crossing(x, y, j - 1, j, half));

    Some(((left + right) / 2.0, (right - left).abs()))
}

/// Full width at half maximum of the peak of `y`.
pub fn fwhm(x: &[f64], y: &[f64]) -> Option<f64> {
    cen(x, y).map(|(_, width)| width)
}

#[cfg(test)]
mod tests {
    use super::*;

    const X: [f64; 5] = [0.0, 1.0, 2.0, 3.0, 4.0];
    const TRIANGLE: [f64; 5] = [0.0, 1.0, 2.0, 1.0, 0.0];

    #[test]
    fn test_peak() {
        assert_eq!(peak(&X, &TRIANGLE), Some((2.0, 2.0)));
        assert_eq!(peak(&[], &[]), None);
    }

    #[test]
    fn test_com() {
        assert_eq!(com(&X, &TRIANGLE), Some(2.0));
        assert_eq!(com(&X, &[0.0; 5]), None);
        assert_eq!(com(&X, &[0.0, 0.0, 0.0, 1.0, 3.0]), Some(3.75));
    }

    #[test]
    fn test_cen_and_fwhm() {
        assert_eq!(cen(&X, &TRIANGLE), Some((2.0, 2.0)));
        assert_eq!(fwhm(&X, &TRIANGLE), Some(2.0));

        // peak at the edge: left side never drops below half maximum
        let (center, width) = cen(&X, &[4.0, 3.0, 2.0, 1.0, 0.0]).unwrap();
        assert_eq!(width, 2.0);
        assert_eq!(center, 1.0);
    }

    #[test]
    fn test_mismatched_lengths_are_truncated() {
        assert_eq!(peak(&X[..3], &TRIANGLE), Some((2.0, 2.0)));
    }

    #[test]
    fn test_scan_data_view() {
        let axis = Channel::scalar("sx");
        let diode = Channel::scalar("diode");
        axis.emit(&X).unwrap();
        diode.emit(&TRIANGLE).unwrap();

        let data = ScanData::new(vec![axis, diode]);
        assert_eq!(data.names().collect::<Vec<_>>(), vec!["diode", "sx"]);
        assert_eq!(data.len_of("sx"), Some(5));
        assert_eq!(data.peak("sx", "diode"), Some((2.0, 2.0)));
        assert_eq!(data.cen("sx", "diode"), Some((2.0, 2.0)));
        assert_eq!(data.com("sx", "missing"), None);
        assert_eq!(data.to_map()["diode"], TRIANGLE.to_vec());
    }
}
