//! Visual area segmentation.
//!
//! Connected-component labeling of the thresholded sign map: neighboring
//! pixels (4-connectivity) carrying the same nonzero sign form one candidate
//! area. Components smaller than the configured minimum cortical area are
//! dropped, and survivors are relabeled 1..=k in discovery order, which is
//! deterministic for identical inputs.

use ndarray::Array2;

/// Label same-sign connected components of `sign`, dropping components with
/// fewer than `min_area_px` pixels. Returns the label map (0 = background)
/// and the number of areas kept.
pub fn label_areas(sign: &Array2<i8>, min_area_px: usize) -> (Array2<i32>, usize) {
    let (height, width) = sign.dim();
    let mut labels = Array2::<i32>::zeros((height, width));
    let mut next_label = 0i32;
    let mut queue = std::collections::VecDeque::new();

    for start_y in 0..height {
        for start_x in 0..width {
            if sign[(start_y, start_x)] == 0 || labels[(start_y, start_x)] != 0 {
                continue;
            }
            let value = sign[(start_y, start_x)];
            next_label += 1;
            let label = next_label;

            // Flood fill this component.
            let mut members = Vec::new();
            labels[(start_y, start_x)] = label;
            queue.push_back((start_y, start_x));
            while let Some((y, x)) = queue.pop_front() {
                members.push((y, x));
                let mut visit = |ny: usize, nx: usize| {
                    if sign[(ny, nx)] == value && labels[(ny, nx)] == 0 {
                        labels[(ny, nx)] = label;
                        queue.push_back((ny, nx));
                    }
                };
                if y > 0 {
                    visit(y - 1, x);
                }
                if y + 1 < height {
                    visit(y + 1, x);
                }
                if x > 0 {
                    visit(y, x - 1);
                }
                if x + 1 < width {
                    visit(y, x + 1);
                }
            }

            // Dropping a small component frees its label for the next one,
            // so surviving labels stay dense.
            if members.len() < min_area_px {
                for (y, x) in members {
                    labels[(y, x)] = 0;
                }
                next_label -= 1;
            }
        }
    }

    (labels, next_label as usize)
}
