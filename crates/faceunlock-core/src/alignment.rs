//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face to the canonical 112×112 ArcFace position using the
//! five InsightFace reference landmarks and a closed-form least-squares fit.

use crate::frame::RgbFrame;

/// ArcFace reference landmarks for a 112×112 output.
pub(crate) const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`,
/// stored as `[a, -b, tx, b, a, ty]`.
type Similarity = [f32; 6];

/// Least-squares similarity transform mapping `src` landmarks onto `dst`.
///
/// Solved in closed form on centred coordinates. Degenerate input (all source
/// points coincide) yields the identity.
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let n = src.len() as f32;
    let (src_mx, src_my) = src.iter().fold((0.0, 0.0), |(x, y), p| (x + p.0, y + p.1));
    let (dst_mx, dst_my) = dst.iter().fold((0.0, 0.0), |(x, y), p| (x + p.0, y + p.1));
    let (src_mx, src_my) = (src_mx / n, src_my / n);
    let (dst_mx, dst_my) = (dst_mx / n, dst_my / n);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut src_energy = 0.0f32;
    for (s, d) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (s.0 - src_mx, s.1 - src_my);
        let (dx, dy) = (d.0 - dst_mx, d.1 - dst_my);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        src_energy += sx * sx + sy * sy;
    }

    if src_energy < 1e-12 {
        return [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    }

    let a = dot / src_energy;
    let b = cross / src_energy;
    let tx = dst_mx - (a * src_mx - b * src_my);
    let ty = dst_my - (b * src_mx + a * src_my);

    [a, -b, tx, b, a, ty]
}

/// Warp an RGB frame through the inverse of `matrix` into an `out_size`² crop.
///
/// Bilinear interpolation per channel; samples outside the frame are black.
fn warp_affine(frame: &RgbFrame, matrix: &Similarity, out_size: usize) -> Vec<u8> {
    let (a, tx, b, ty) = (matrix[0], matrix[2], matrix[3], matrix[5]);
    let mut output = vec![0u8; out_size * out_size * 3];

    let det = a * a + b * b;
    if det < 1e-12 {
        return output;
    }
    let ia = a / det;
    let ib = b / det;

    let width = frame.width as i32;
    let height = frame.height as i32;
    let sample = |x: i32, y: i32| -> [f32; 3] {
        if x >= 0 && x < width && y >= 0 && y < height {
            let [r, g, b] = frame.pixel(x as usize, y as usize);
            [r as f32, g as f32, b as f32]
        } else {
            [0.0; 3]
        }
    };

    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let tl = sample(x0, y0);
            let tr = sample(x0 + 1, y0);
            let bl = sample(x0, y0 + 1);
            let br = sample(x0 + 1, y0 + 1);

            let out = (oy * out_size + ox) * 3;
            for c in 0..3 {
                let val = tl[c] * (1.0 - fx) * (1.0 - fy)
                    + tr[c] * fx * (1.0 - fy)
                    + bl[c] * (1.0 - fx) * fy
                    + br[c] * fx * fy;
                output[out + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

/// Align a detected face to a canonical 112×112 RGB crop (packed, 3 bytes per pixel).
pub fn align_face(frame: &RgbFrame, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(frame, &matrix, ALIGNED_SIZE)
}
