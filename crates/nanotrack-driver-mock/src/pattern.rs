//! Synthetic sensor images.

/// Simple pseudo-random number generator (LCG) for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// A Gaussian spot in sensor coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spot {
    /// Column of the centre, in pixels
    pub x: f64,
    /// Row of the centre, in pixels
    pub y: f64,
    /// Standard deviation in pixels
    pub sigma: f64,
    /// Height above background in counts
    pub peak: f64,
}

impl Spot {
    /// Spot at `(x, y)` with a 2 px sigma and half full-scale peak.
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            sigma: 2.0,
            peak: 32768.0,
        }
    }
}

/// Render `spots` on a flat `background` with optional per-pixel noise.
///
/// Returns row-major pixels, `height` rows of `width` columns. `noise` is the
/// peak-to-peak noise amplitude in counts; `seed` varies it between frames.
pub fn render_spots(
    width: usize,
    height: usize,
    spots: &[Spot],
    background: u16,
    noise: u16,
    seed: u64,
) -> Vec<u16> {
    let mut buffer = vec![0u16; width * height];
    let frame_seed = seed.wrapping_mul(2654435761);

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let mut value = f64::from(background);
            if noise > 0 {
                let n = prng(frame_seed ^ idx as u64) % (u64::from(noise) + 1);
                value += n as f64 - f64::from(noise) / 2.0;
            }
            for spot in spots {
                let dx = x as f64 - spot.x;
                let dy = y as f64 - spot.y;
                let two_sigma_sq = 2.0 * spot.sigma * spot.sigma;
                value += spot.peak * (-(dx * dx + dy * dy) / two_sigma_sq).exp();
            }
            buffer[idx] = value.clamp(0.0, 65535.0) as u16;
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_size() {
        assert_eq!(render_spots(40, 30, &[], 100, 0, 0).len(), 40 * 30);
    }

    #[test]
    fn test_spot_peak_at_centre() {
        let pixels = render_spots(20, 10, &[Spot::new(5.0, 4.0)], 0, 0, 0);
        let (argmax, _) = pixels
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
            .unwrap();
        assert_eq!(argmax, 4 * 20 + 5);
    }

    #[test]
    fn test_noise_varies_with_seed() {
        let a = render_spots(16, 16, &[], 1000, 50, 0);
        let b = render_spots(16, 16, &[], 1000, 50, 1);
        assert_ne!(a, b);
        assert!(a.iter().all(|v| (975..=1025).contains(v)));
    }
}
