use nanorand::Rng as _;

/// Sets of multi-jittered samples on the unit square, and the same samples
/// mapped onto a cosine weighted hemisphere around `+Z`.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleSet {
    samples_per_set: u32,
    set_count: u32,
    unit_square: Vec<[f32; 2]>,
    hemisphere: Vec<glam::Vec3>,
}

fn random_unit(rng: &mut nanorand::WyRand) -> f32 {
    (rng.generate::<u32>() >> 8) as f32 / (1u32 << 24) as f32
}

/// Position inside stratum `k` of `n`, strictly below the next stratum.
fn stratified(k: usize, n: usize, jitter: f32) -> f32 {
    let upper = (k + 1) as f32 / n as f32;
    let value = (k as f32 + jitter) / n as f32;
    if value >= upper {
        f32::from_bits(upper.to_bits() - 1)
    } else {
        value
    }
}

/// Multi-jittered pattern of `rows * cols` samples: jittered in the grid
/// of cells and n-rooks in the grid of sub-cells.
fn multi_jittered(rows: usize, cols: usize, rng: &mut nanorand::WyRand) -> Vec<[f32; 2]> {
    let n = rows * cols;
    // canonical arrangement, as sub-cell indices
    let mut cells = vec![[0usize; 2]; n];
    for j in 0..rows {
        for i in 0..cols {
            cells[j * cols + i] = [i * rows + j, j * cols + i];
        }
    }
    // shuffle x within columns, y within rows
    for j in 0..rows {
        for i in 0..cols {
            let k = j + rng.generate_range(0..rows - j);
            let x = cells[j * cols + i][0];
            cells[j * cols + i][0] = cells[k * cols + i][0];
            cells[k * cols + i][0] = x;
        }
    }
    for i in 0..cols {
        for j in 0..rows {
            let k = i + rng.generate_range(0..cols - i);
            let y = cells[j * cols + i][1];
            cells[j * cols + i][1] = cells[j * cols + k][1];
            cells[j * cols + k][1] = y;
        }
    }
    let mut points = cells
        .iter()
        .map(|&[x, y]| {
            [
                stratified(x, n, random_unit(rng)),
                stratified(y, n, random_unit(rng)),
            ]
        })
        .collect::<Vec<_>>();
    rng.shuffle(&mut points);
    points
}

/// Cosine weighted direction on the hemisphere around `+Z`.
pub fn cosine_hemisphere(u: [f32; 2]) -> glam::Vec3 {
    let r = u[0].sqrt();
    let phi = 2.0 * std::f32::consts::PI * u[1];
    glam::Vec3::new(r * phi.cos(), r * phi.sin(), (1.0 - u[0]).max(0.0).sqrt())
}

impl SampleSet {
    /// Generate `set_count` sets of `samples_per_set` samples.
    /// The result only depends on the arguments.
    #[profiling::function]
    pub fn generate(samples_per_set: u32, set_count: u32, seed: u64) -> Self {
        assert_ne!(samples_per_set, 0);
        assert_ne!(set_count, 0);
        let mut rng = nanorand::WyRand::new_seed(seed);
        let cols = (samples_per_set as f32).sqrt().ceil() as usize;
        let rows = (samples_per_set as usize).div_ceil(cols);
        let mut unit_square = Vec::with_capacity((samples_per_set * set_count) as usize);
        for _ in 0..set_count {
            let mut points = multi_jittered(rows, cols, &mut rng);
            points.truncate(samples_per_set as usize);
            unit_square.extend(points);
        }
        let hemisphere = unit_square.iter().map(|&u| cosine_hemisphere(u)).collect();
        log::debug!(
            "Generated {} sample sets of {} samples with seed {}",
            set_count,
            samples_per_set,
            seed
        );
        Self {
            samples_per_set,
            set_count,
            unit_square,
            hemisphere,
        }
    }

    pub fn samples_per_set(&self) -> u32 {
        self.samples_per_set
    }

    pub fn set_count(&self) -> u32 {
        self.set_count
    }

    pub fn unit_square(&self, set: u32) -> &[[f32; 2]] {
        let n = self.samples_per_set as usize;
        let start = (set % self.set_count) as usize * n;
        &self.unit_square[start..start + n]
    }

    pub fn hemisphere(&self, set: u32) -> &[glam::Vec3] {
        let n = self.samples_per_set as usize;
        let start = (set % self.set_count) as usize * n;
        &self.hemisphere[start..start + n]
    }

    /// Hemisphere samples padded to 16 bytes.
    pub(crate) fn hemisphere_data(&self) -> Vec<[f32; 4]> {
        self.hemisphere
            .iter()
            .map(|v| [v.x, v.y, v.z, 0.0])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::SampleSet;

    #[test]
    fn deterministic() {
        let a = SampleSet::generate(8, 4, 17);
        let b = SampleSet::generate(8, 4, 17);
        let c = SampleSet::generate(8, 4, 18);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hemisphere_is_upper() {
        let set = SampleSet::generate(16, 3, 5);
        for s in 0..3 {
            for v in set.hemisphere(s) {
                assert!(v.z >= 0.0);
                assert!((v.length() - 1.0).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn stratified() {
        // a perfect square count covers every row and column stratum once
        let set = SampleSet::generate(16, 1, 3);
        let mut columns = [0; 16];
        let mut rows = [0; 16];
        for p in set.unit_square(0) {
            assert!((0.0..1.0).contains(&p[0]) && (0.0..1.0).contains(&p[1]));
            columns[(p[0] * 16.0) as usize] += 1;
            rows[(p[1] * 16.0) as usize] += 1;
        }
        assert!(columns.iter().all(|&c| c == 1));
        assert!(rows.iter().all(|&c| c == 1));
    }
}
