//! Real spherical harmonics basis, degrees 0 through 4

use crate::core::Vec3;

/// Maximum supported basis size (degree 4)
pub const MAX_BASIS_DIM: usize = 25;

const C0: f32 = 0.282_094_79;
const C1: f32 = 0.488_602_51;
const C2: [f32; 5] = [
    1.092_548_4,
    -1.092_548_4,
    0.315_391_57,
    -1.092_548_4,
    0.546_274_2,
];
const C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_33,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];
const C4: [f32; 9] = [
    2.503_343,
    -1.770_130_8,
    0.946_174_7,
    -0.669_046_56,
    0.105_785_55,
    -0.669_046_56,
    0.473_087_34,
    -1.770_130_8,
    0.625_835_7,
];

/// Basis sizes with a complete set of degrees: 1, 4, 9, 16, 25
pub fn is_valid_basis_dim(basis_dim: usize) -> bool {
    matches!(basis_dim, 1 | 4 | 9 | 16 | 25)
}

/// Evaluate the first `basis_dim` basis functions at unit direction `dir`.
/// Entries past `basis_dim` are zero.
pub fn eval_basis(basis_dim: usize, dir: Vec3) -> [f32; MAX_BASIS_DIM] {
    let mut out = [0.0f32; MAX_BASIS_DIM];
    out[0] = C0;
    if basis_dim <= 1 {
        return out;
    }
    let Vec3 { x, y, z } = dir;
    out[1] = -C1 * y;
    out[2] = C1 * z;
    out[3] = -C1 * x;
    if basis_dim <= 4 {
        return out;
    }
    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, yz, xz) = (x * y, y * z, x * z);
    out[4] = C2[0] * xy;
    out[5] = C2[1] * yz;
    out[6] = C2[2] * (2.0 * zz - xx - yy);
    out[7] = C2[3] * xz;
    out[8] = C2[4] * (xx - yy);
    if basis_dim <= 9 {
        return out;
    }
    out[9] = C3[0] * y * (3.0 * xx - yy);
    out[10] = C3[1] * xy * z;
    out[11] = C3[2] * y * (4.0 * zz - xx - yy);
    out[12] = C3[3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy);
    out[13] = C3[4] * x * (4.0 * zz - xx - yy);
    out[14] = C3[5] * z * (xx - yy);
    out[15] = C3[6] * x * (xx - 3.0 * yy);
    if basis_dim <= 16 {
        return out;
    }
    out[16] = C4[0] * xy * (xx - yy);
    out[17] = C4[1] * yz * (3.0 * xx - yy);
    out[18] = C4[2] * xy * (7.0 * zz - 1.0);
    out[19] = C4[3] * yz * (7.0 * zz - 3.0);
    out[20] = C4[4] * (zz * (35.0 * zz - 30.0) + 3.0);
    out[21] = C4[5] * xz * (7.0 * zz - 3.0);
    out[22] = C4[6] * (xx - yy) * (7.0 * zz - 1.0);
    out[23] = C4[7] * xz * (xx - 3.0 * yy);
    out[24] = C4[8] * (xx * (xx - 3.0 * yy) - yy * (3.0 * xx - yy));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_dims() {
        assert!(is_valid_basis_dim(1));
        assert!(is_valid_basis_dim(9));
        assert!(!is_valid_basis_dim(3));
        assert!(!is_valid_basis_dim(36));
    }

    #[test]
    fn test_degree_zero_is_constant() {
        let a = eval_basis(1, Vec3::X);
        let b = eval_basis(1, Vec3::new(0.0, 0.6, 0.8));
        assert_eq!(a, b);
        assert!(a[1..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_degree_one_is_odd() {
        let d = Vec3::new(0.36, 0.48, 0.8);
        let a = eval_basis(4, d);
        let b = eval_basis(4, -d);
        for j in 1..4 {
            assert!((a[j] + b[j]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_orthonormal_by_quadrature() {
        // Monte Carlo over a Fibonacci sphere: integral of Y_i Y_j = delta_ij
        let samples = 20_000;
        let golden = std::f32::consts::PI * (3.0 - 5f32.sqrt());
        let mut gram = [[0.0f64; MAX_BASIS_DIM]; MAX_BASIS_DIM];
        for s in 0..samples {
            let z = 1.0 - 2.0 * (s as f32 + 0.5) / samples as f32;
            let r = (1.0 - z * z).sqrt();
            let phi = golden * s as f32;
            let basis = eval_basis(25, Vec3::new(r * phi.cos(), r * phi.sin(), z));
            for i in 0..25 {
                for j in 0..25 {
                    gram[i][j] += (basis[i] * basis[j]) as f64;
                }
            }
        }
        let scale = 4.0 * std::f64::consts::PI / samples as f64;
        for i in 0..25 {
            for j in 0..25 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[i][j] * scale - expected).abs() < 2e-2, "({i}, {j})");
            }
        }
    }
}
