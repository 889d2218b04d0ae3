//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face onto the canonical InsightFace five-point layout,
//! scaled to whatever square input size the recognizer expects.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// Reference landmarks for a 112×112 crop.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const REFERENCE_SIZE: f32 = 112.0;

/// 2×3 similarity matrix `[a, -b, tx, b, a, ty]`.
type Similarity = [f32; 6];

/// Reference landmarks scaled to an `out_size × out_size` crop.
fn reference_landmarks(out_size: u32) -> [(f32, f32); 5] {
    let s = out_size as f32 / REFERENCE_SIZE;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * s, y * s))
}

/// Least-squares similarity transform mapping `src` points onto `dst`.
///
/// Solved in closed form on centered coordinates, which is what the 4×4
/// normal equations reduce to for this parameterization.
fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (smx, smy) = mean(src);
    let (dmx, dmy) = mean(dst);

    let mut dot = 0.0f32; // Σ s·d
    let mut cross = 0.0f32; // Σ s×d
    let mut src_var = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx - smx, sy - smy);
        let (dx, dy) = (dx - dmx, dy - dmy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        src_var += sx * sx + sy * sy;
    }

    if src_var < 1e-12 {
        // Degenerate landmarks: pure translation onto the reference centroid.
        return [1.0, 0.0, dmx - smx, 0.0, 1.0, dmy - smy];
    }

    let a = dot / src_var;
    let b = cross / src_var;
    let tx = dmx - (a * smx - b * smy);
    let ty = dmy - (b * smx + a * smy);

    [a, -b, tx, b, a, ty]
}

/// Warp `src` through `m` into an `out_size × out_size` RGB crop.
///
/// Bilinear sampling; pixels mapped outside the source are black.
fn warp_affine(src: &RgbImage, m: &Similarity, out_size: u32) -> RgbImage {
    let (a, b, tx, ty) = (m[0], m[3], m[2], m[5]);
    let det = a * a + b * b;
    if det < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let (ia, ib) = (a / det, b / det);
    let (w, h) = (src.width() as i64, src.height() as i64);

    let sample = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let Rgb(p) = *src.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        let mut px = [0u8; 3];
        for c in 0..3 {
            let v = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}

/// Align a face to a canonical `out_size × out_size` crop using its landmarks.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], out_size: u32) -> RgbImage {
    let m = estimate_similarity(landmarks, &reference_landmarks(out_size));
    warp_affine(image, &m, out_size)
}

/// Crop a face region and stretch it to `out_size × out_size`.
///
/// Fallback for regions that carry no landmarks (whole-frame or `skip`).
pub fn crop_face(image: &RgbImage, face: &BoundingBox, out_size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return RgbImage::new(out_size, out_size);
    }
    let x = face.x.max(0.0).floor() as u32;
    let y = face.y.max(0.0).floor() as u32;
    let x = x.min(w - 1);
    let y = y.min(h - 1);
    let cw = (face.width.ceil() as u32).clamp(1, w - x);
    let ch = (face.height.ceil() as u32).clamp(1, h - y);

    let region = imageops::crop_imm(image, x, y, cw, ch).to_image();
    imageops::resize(&region, out_size, out_size, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity(&pts, &pts);
        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        // Landmarks at twice the reference scale should shrink by ~0.5.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}", m[0]);
        assert!(m[3].abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_rotated_transform() {
        // Rotate the reference by 90°: (x, y) -> (-y, x). The inverse rotation
        // has a ≈ 0, b ≈ -1.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (-y, x));
        let m = estimate_similarity(&src, &REFERENCE_LANDMARKS_112);
        assert!(m[0].abs() < 1e-3, "a = {}", m[0]);
        assert!((m[3] + 1.0).abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_reference_scaled_for_facenet_input() {
        let pts = reference_landmarks(160);
        assert!((pts[0].0 - 38.2946 * 160.0 / 112.0).abs() < 1e-3);
    }

    #[test]
    fn test_align_face_output_size() {
        let img = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        assert_eq!(align_face(&img, &REFERENCE_LANDMARKS_112, 112).dimensions(), (112, 112));
        assert_eq!(align_face(&img, &REFERENCE_LANDMARKS_112, 160).dimensions(), (160, 160));
    }

    #[test]
    fn test_degenerate_landmarks_do_not_panic() {
        let img = RgbImage::from_pixel(50, 50, Rgb([1, 2, 3]));
        let out = align_face(&img, &[(10.0, 10.0); 5], 112);
        assert_eq!(out.dimensions(), (112, 112));
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the left eye should land near the reference left eye.
        let mut img = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for dy in 0..5 {
            for dx in 0..5 {
                img.put_pixel(78 + dx, 58 + dy, Rgb([255, 0, 255]));
            }
        }

        let aligned = align_face(&img, &src, 112);
        let (rx, ry) = (38u32, 52u32);
        let max_red = (rx - 1..=rx + 1)
            .flat_map(|x| (ry - 1..=ry + 1).map(move |y| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap();
        assert!(max_red > 100, "expected bright patch near ({rx}, {ry}), max={max_red}");
        // Green channel was never painted.
        assert_eq!(aligned.get_pixel(rx, ry).0[1], 0);
    }

    #[test]
    fn test_crop_face_clamps_to_image() {
        let img = RgbImage::from_pixel(40, 30, Rgb([9, 9, 9]));
        let face = BoundingBox {
            x: -10.0, y: 20.0, width: 100.0, height: 100.0,
            confidence: 0.9, landmarks: None,
        };
        let out = crop_face(&img, &face, 160);
        assert_eq!(out.dimensions(), (160, 160));
        assert_eq!(out.get_pixel(80, 80), &Rgb([9, 9, 9]));
    }

    #[test]
    fn test_crop_full_frame() {
        let img = RgbImage::from_pixel(7, 3, Rgb([50, 60, 70]));
        let out = crop_face(&img, &BoundingBox::full_frame(7, 3), 112);
        assert_eq!(out.dimensions(), (112, 112));
    }
}
