//! Spot locator: thresholded blob centroiding.
//!
//! 1. Smooth the frame with a 3x3 box filter.
//! 2. Take the median as the background level.
//! 3. If the highest smoothed peak is less than `sensitivity` above the
//!    background, there is no spot.
//! 4. Segment the pixels more than `sensitivity` above background into
//!    8-connected regions.
//! 5. More than `max_spots` regions is ambiguous; otherwise the region with the
//!    highest peak wins.
//! 6. The centroid is weighted over the pixels of the winning region above
//!    half its peak height, so a wide halo does not pull it off centre.
//!
//! Centroids are in pixel coordinates where pixel `i` spans `[i, i + 1)`, so
//! the optical centre of a frame is `(width / 2, height / 2)`.

use daq_core::frame::Frame;
use serde::{Deserialize, Serialize};

use crate::config::LocatorConfig;

/// Spot centre in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    /// Column coordinate
    pub x: f64,
    /// Row coordinate
    pub y: f64,
}

/// Result of a spot search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpotSearch {
    /// One spot selected
    Found(Centroid),
    /// No qualifying region
    NotFound,
    /// Too many qualifying regions (count attached)
    Ambiguous(usize),
}

impl SpotSearch {
    /// The centroid, if found.
    pub fn centroid(&self) -> Option<Centroid> {
        match self {
            SpotSearch::Found(c) => Some(*c),
            _ => None,
        }
    }
}

/// Pure spot detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotLocator {
    sensitivity: f64,
    max_spots: usize,
}

impl Default for SpotLocator {
    fn default() -> Self {
        Self::from_config(&LocatorConfig::default())
    }
}

struct Region {
    peak: f64,
    pixels: Vec<usize>,
}

impl SpotLocator {
    /// Locator with explicit parameters.
    pub fn new(sensitivity: f64, max_spots: usize) -> Self {
        Self {
            sensitivity,
            max_spots,
        }
    }

    /// Locator from configuration.
    pub fn from_config(config: &LocatorConfig) -> Self {
        Self::new(config.sensitivity, config.max_spots)
    }

    /// Same locator with another sensitivity.
    pub fn with_sensitivity(self, sensitivity: f64) -> Self {
        Self {
            sensitivity,
            ..self
        }
    }

    /// Minimum peak height above background.
    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    /// Find the spot in `frame`.
    pub fn locate(&self, frame: &Frame) -> SpotSearch {
        let (w, h) = (frame.width(), frame.height());
        if w == 0 || h == 0 {
            return SpotSearch::NotFound;
        }
        let smoothed = box_filter(frame);
        let background = median(&smoothed);
        let peak = smoothed.iter().cloned().fold(f64::MIN, f64::max);
        if peak - background < self.sensitivity {
            return SpotSearch::NotFound;
        }

        let regions = label_regions(&smoothed, w, h, background + self.sensitivity);
        if regions.is_empty() {
            return SpotSearch::NotFound;
        }
        if regions.len() > self.max_spots {
            return SpotSearch::Ambiguous(regions.len());
        }

        let mut best = &regions[0];
        for region in &regions[1..] {
            if region.peak > best.peak {
                best = region;
            }
        }
        SpotSearch::Found(centroid(&smoothed, w, best, background, self.sensitivity))
    }
}

/// Intensity-weighted centre of the pixels of `region` above half its peak.
fn centroid(data: &[f64], w: usize, region: &Region, background: f64, sensitivity: f64) -> Centroid {
    let cut = background + sensitivity.max((region.peak - background) / 2.0);
    let (mut weight, mut sum_x, mut sum_y) = (0.0, 0.0, 0.0);
    for &idx in &region.pixels {
        let value = data[idx];
        if value <= cut {
            continue;
        }
        let v = value - background;
        weight += v;
        sum_x += v * ((idx % w) as f64 + 0.5);
        sum_y += v * ((idx / w) as f64 + 0.5);
    }
    Centroid {
        x: sum_x / weight,
        y: sum_y / weight,
    }
}

/// 3x3 mean, averaging only the neighbours inside the frame.
fn box_filter(frame: &Frame) -> Vec<f64> {
    let (w, h) = (frame.width(), frame.height());
    let src = frame.pixels();
    let mut out = vec![0.0; w * h];
    for y in 0..h {
        let (y0, y1) = (y.saturating_sub(1), (y + 1).min(h - 1));
        for x in 0..w {
            let (x0, x1) = (x.saturating_sub(1), (x + 1).min(w - 1));
            let mut sum = 0.0;
            for yy in y0..=y1 {
                sum += src[yy * w + x0..=yy * w + x1].iter().sum::<f64>();
            }
            out[y * w + x] = sum / ((y1 - y0 + 1) * (x1 - x0 + 1)) as f64;
        }
    }
    out
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted[sorted.len() / 2]
}

/// 8-connected regions above `threshold`, in scan order of their first pixel.
fn label_regions(data: &[f64], w: usize, h: usize, threshold: f64) -> Vec<Region> {
    let mut visited = vec![false; data.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..data.len() {
        if visited[start] || data[start] <= threshold {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        let mut region = Region {
            peak: f64::MIN,
            pixels: Vec::new(),
        };

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            region.peak = region.peak.max(data[idx]);
            region.pixels.push(idx);

            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let n = ny * w + nx;
                    if !visited[n] && data[n] > threshold {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
        }
        regions.push(region);
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat frame with Gaussian spots `(x, y, amplitude)`.
    fn spots(w: usize, h: usize, spots: &[(f64, f64, f64)]) -> Frame {
        let mut data = vec![0.0; w * h];
        for (i, v) in data.iter_mut().enumerate() {
            let (px, py) = ((i % w) as f64 + 0.5, (i / w) as f64 + 0.5);
            for &(x, y, a) in spots {
                let r2 = (px - x).powi(2) + (py - y).powi(2);
                *v += a * (-r2 / 8.0).exp();
            }
        }
        Frame::new(w, h, data).unwrap()
    }

    #[test]
    fn test_locates_single_spot() {
        let frame = spots(64, 48, &[(20.0, 30.0, 1000.0)]);
        let c = SpotLocator::default().locate(&frame).centroid().unwrap();
        assert!((c.x - 20.0).abs() < 0.05, "x = {}", c.x);
        assert!((c.y - 30.0).abs() < 0.05, "y = {}", c.y);
    }

    #[test]
    fn test_empty_frame_not_found() {
        let frame = Frame::filled(32, 32, 0.0).unwrap();
        assert_eq!(SpotLocator::default().locate(&frame), SpotSearch::NotFound);
    }

    #[test]
    fn test_faint_spot_below_sensitivity() {
        let frame = spots(32, 32, &[(16.0, 16.0, 50.0)]);
        assert_eq!(SpotLocator::default().locate(&frame), SpotSearch::NotFound);
        assert!(matches!(
            SpotLocator::default().with_sensitivity(10.0).locate(&frame),
            SpotSearch::Found(_)
        ));
    }

    fn grid(n: usize) -> Vec<(f64, f64, f64)> {
        (0..n)
            .map(|i| (10.0 + 20.0 * (i % 6) as f64, 10.0 + 20.0 * (i / 6) as f64, 1000.0))
            .collect()
    }

    #[test]
    fn test_eleven_spots_ambiguous() {
        let frame = spots(128, 64, &grid(11));
        assert_eq!(SpotLocator::default().locate(&frame), SpotSearch::Ambiguous(11));
    }

    #[test]
    fn test_dim_spots_count_toward_ambiguous() {
        // One bright spot must not hide eleven dimmer ones well above sensitivity
        let mut spots_list = grid(12);
        spots_list[0].2 = 10000.0;
        let frame = spots(128, 64, &spots_list);
        assert_eq!(SpotLocator::default().locate(&frame), SpotSearch::Ambiguous(12));
    }

    #[test]
    fn test_halo_does_not_pull_centroid() {
        // Dim neighbour merged into the bright spot's region above sensitivity
        let frame = spots(64, 48, &[(20.0, 24.0, 2000.0), (27.0, 24.0, 300.0)]);
        let c = SpotLocator::default().locate(&frame).centroid().unwrap();
        assert!((c.x - 20.0).abs() < 0.3, "x = {}", c.x);
        assert!((c.y - 24.0).abs() < 0.05, "y = {}", c.y);
    }

    #[test]
    fn test_ten_spots_picks_brightest() {
        let mut spots_list = grid(10);
        spots_list[7].2 = 1500.0;
        let (bx, by, _) = spots_list[7];
        let frame = spots(128, 64, &spots_list);

        let c = SpotLocator::default().locate(&frame).centroid().unwrap();
        assert!((c.x - bx).abs() < 0.1 && (c.y - by).abs() < 0.1, "{c:?}");
    }

    #[test]
    fn test_centre_spot_at_frame_center() {
        let frame = spots(40, 40, &[(20.0, 20.0, 800.0)]);
        let c = SpotLocator::default().locate(&frame).centroid().unwrap();
        let (cx, cy) = frame.center();
        assert!((c.x - cx).abs() < 1e-9 && (c.y - cy).abs() < 1e-9);
    }
}
