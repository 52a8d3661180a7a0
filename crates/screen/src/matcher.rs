//! Template matching
//!
//! [`NccMatcher`] scores every placement of a template with zero-mean
//! normalized cross-correlation on luma, the score OpenCV calls
//! `TM_CCOEFF_NORMED`. Window sums come from integral images. Large
//! templates are first searched on downscaled copies and the best coarse
//! candidates refined at full resolution. Each axis is downscaled on its
//! own, so thin labels still get a coarse pass along their long side.

use image::GrayImage;
use sightline_common::Result;
use std::sync::Arc;

use crate::reference::ReferenceImage;

/// Side the coarse template must keep along each axis
const MIN_COARSE_SIDE: u32 = 12;
const MAX_COARSE_FACTOR: u32 = 8;
/// Coarse candidates refined at full resolution
const REFINE_CANDIDATES: usize = 8;
const EPSILON: f64 = 1e-9;

/// An occurrence of a reference image on screen
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub image: Arc<ReferenceImage>,
    /// Top-left corner of the match
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f64,
}

impl MatchResult {
    /// Pointer target: the centre of the match shifted by the image's focus delta
    pub fn focus_point(&self) -> (i32, i32) {
        let (dx, dy) = self.image.focus_delta();
        (
            self.x as i32 + (self.width / 2) as i32 + dx,
            self.y as i32 + (self.height / 2) as i32 + dy,
        )
    }
}

/// Locates reference images on a captured screen
pub trait TemplateMatcher: Send + Sync {
    /// Best placement of `image` on `screen` if it reaches the image's similarity
    fn find(&self, screen: &GrayImage, image: &Arc<ReferenceImage>) -> Result<Option<MatchResult>>;
}

/// Normalized cross-correlation matcher
#[derive(Debug, Clone, Default)]
pub struct NccMatcher {
    min_screen: Option<(u32, u32)>,
}

impl NccMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat screens no larger than `width` x `height` as incomplete
    pub fn with_min_screen(mut self, width: u32, height: u32) -> Self {
        self.min_screen = Some((width, height));
        self
    }

    /// Highest scoring placement regardless of any threshold
    pub fn best_placement(&self, screen: &GrayImage, template: &GrayImage) -> Option<(u32, u32, f64)> {
        if let Some((min_w, min_h)) = self.min_screen {
            if screen.width() <= min_w && screen.height() <= min_h {
                return None;
            }
        }
        if template.width() == 0
            || template.height() == 0
            || template.width() > screen.width()
            || template.height() > screen.height()
        {
            return None;
        }

        let screen = Plane::from_luma(screen);
        let template = Plane::from_luma(template);
        let factors = (coarse_factor(template.width), coarse_factor(template.height));

        let best = if factors == (1, 1) {
            let integral = Integral::new(&screen);
            let tpl = Template::new(&template);
            search(
                &screen,
                &integral,
                &tpl,
                0..=screen.width - tpl.width,
                0..=screen.height - tpl.height,
            )
        } else {
            refine_from_coarse(&screen, &template, factors)
        };

        best.map(|(x, y, score)| (x as u32, y as u32, score))
    }
}

impl TemplateMatcher for NccMatcher {
    fn find(&self, screen: &GrayImage, image: &Arc<ReferenceImage>) -> Result<Option<MatchResult>> {
        let template = image.pixels()?;
        Ok(self
            .best_placement(screen, template)
            .filter(|&(_, _, score)| score >= image.similarity())
            .map(|(x, y, confidence)| MatchResult {
                image: image.clone(),
                x,
                y,
                width: template.width(),
                height: template.height(),
                confidence,
            }))
    }
}

fn coarse_factor(side: usize) -> usize {
    let mut factor = 1;
    while factor < MAX_COARSE_FACTOR as usize && side / (factor * 2) >= MIN_COARSE_SIDE as usize {
        factor *= 2;
    }
    factor
}

fn refine_from_coarse(
    screen: &Plane,
    template: &Plane,
    (fx, fy): (usize, usize),
) -> Option<(usize, usize, f64)> {
    let small_screen = screen.downscale(fx, fy);
    let small_template = template.downscale(fx, fy);
    if small_template.width > small_screen.width || small_template.height > small_screen.height {
        return None;
    }

    let small_integral = Integral::new(&small_screen);
    let small_tpl = Template::new(&small_template);
    let mut candidates: Vec<(f64, usize, usize)> = Vec::with_capacity(REFINE_CANDIDATES + 1);
    for y in 0..=small_screen.height - small_tpl.height {
        for x in 0..=small_screen.width - small_tpl.width {
            let score = small_tpl.score(&small_screen, &small_integral, x, y);
            if candidates.len() < REFINE_CANDIDATES || score > candidates[candidates.len() - 1].0 {
                let at = candidates.partition_point(|c| c.0 >= score);
                candidates.insert(at, (score, x, y));
                candidates.truncate(REFINE_CANDIDATES);
            }
        }
    }

    let integral = Integral::new(screen);
    let tpl = Template::new(template);
    let max_x = screen.width - tpl.width;
    let max_y = screen.height - tpl.height;

    candidates
        .into_iter()
        .filter_map(|(_, cx, cy)| {
            let x0 = (cx * fx).saturating_sub(fx);
            let y0 = (cy * fy).saturating_sub(fy);
            let x1 = (cx * fx + fx).min(max_x);
            let y1 = (cy * fy + fy).min(max_y);
            if x0 > x1 || y0 > y1 {
                return None;
            }
            search(screen, &integral, &tpl, x0..=x1, y0..=y1)
        })
        .fold(None, |best: Option<(usize, usize, f64)>, found| match best {
            Some(b) if b.2 >= found.2 => Some(b),
            _ => Some(found),
        })
}

fn search(
    screen: &Plane,
    integral: &Integral,
    tpl: &Template,
    xs: std::ops::RangeInclusive<usize>,
    ys: std::ops::RangeInclusive<usize>,
) -> Option<(usize, usize, f64)> {
    let mut best: Option<(usize, usize, f64)> = None;
    for y in ys {
        for x in xs.clone() {
            let score = tpl.score(screen, integral, x, y);
            if best.map_or(true, |b| score > b.2) {
                best = Some((x, y, score));
            }
        }
    }
    best
}

struct Plane {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl Plane {
    fn from_luma(image: &GrayImage) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            data: image.as_raw().iter().map(|&v| v as f64).collect(),
        }
    }

    /// Box-filtered copy, `fx` times narrower and `fy` times shorter
    fn downscale(&self, fx: usize, fy: usize) -> Self {
        let width = self.width / fx;
        let height = self.height / fy;
        let area = (fx * fy) as f64;
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let mut sum = 0.0;
                for row in y * fy..(y + 1) * fy {
                    let start = row * self.width + x * fx;
                    sum += self.data[start..start + fx].iter().sum::<f64>();
                }
                data.push(sum / area);
            }
        }
        Self { width, height, data }
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }
}

/// Summed-area tables of values and squared values
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    squares: Vec<f64>,
}

impl Integral {
    fn new(plane: &Plane) -> Self {
        let stride = plane.width + 1;
        let mut sum = vec![0.0; stride * (plane.height + 1)];
        let mut squares = vec![0.0; stride * (plane.height + 1)];
        for y in 0..plane.height {
            let mut row_sum = 0.0;
            let mut row_squares = 0.0;
            for x in 0..plane.width {
                let v = plane.at(x, y);
                row_sum += v;
                row_squares += v * v;
                let at = (y + 1) * stride + x + 1;
                sum[at] = sum[at - stride] + row_sum;
                squares[at] = squares[at - stride] + row_squares;
            }
        }
        Self {
            stride,
            sum,
            squares,
        }
    }

    /// Sum and sum of squares of a window
    fn window(&self, x: usize, y: usize, width: usize, height: usize) -> (f64, f64) {
        let a = y * self.stride + x;
        let b = a + width;
        let c = (y + height) * self.stride + x;
        let d = c + width;
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.squares[d] - self.squares[b] - self.squares[c] + self.squares[a],
        )
    }
}

/// Template with its mean removed
struct Template {
    width: usize,
    height: usize,
    centered: Vec<f64>,
    mean: f64,
    norm: f64,
}

impl Template {
    fn new(plane: &Plane) -> Self {
        let count = plane.data.len() as f64;
        let mean = plane.data.iter().sum::<f64>() / count;
        let centered: Vec<f64> = plane.data.iter().map(|v| v - mean).collect();
        let norm = centered.iter().map(|v| v * v).sum::<f64>().sqrt();
        Self {
            width: plane.width,
            height: plane.height,
            centered,
            mean,
            norm,
        }
    }

    fn score(&self, screen: &Plane, integral: &Integral, x: usize, y: usize) -> f64 {
        let count = (self.width * self.height) as f64;
        let (sum, squares) = integral.window(x, y, self.width, self.height);
        let variance = (squares - sum * sum / count).max(0.0);

        if self.norm < EPSILON {
            // flat template: only a flat window of the same shade matches
            if variance / count < 1.0 {
                return 1.0 - ((sum / count) - self.mean).abs() / 255.0;
            }
            return 0.0;
        }
        if variance < EPSILON {
            return 0.0;
        }

        let mut cross = 0.0;
        for row in 0..self.height {
            let screen_row = &screen.data[(y + row) * screen.width + x..][..self.width];
            let tpl_row = &self.centered[row * self.width..][..self.width];
            cross += screen_row
                .iter()
                .zip(tpl_row)
                .map(|(s, t)| s * t)
                .sum::<f64>();
        }

        (cross / (variance.sqrt() * self.norm)).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pattern;
    use image::Luma;

    fn screen_with(template: &GrayImage, x: u32, y: u32, width: u32, height: u32) -> GrayImage {
        let mut screen = GrayImage::from_pixel(width, height, Luma([128]));
        image::imageops::replace(&mut screen, template, x as i64, y as i64);
        screen
    }

    #[test]
    fn test_coarse_factor() {
        assert_eq!(coarse_factor(16), 1);
        assert_eq!(coarse_factor(24), 2);
        assert_eq!(coarse_factor(40), 2);
        assert_eq!(coarse_factor(48), 4);
        assert_eq!(coarse_factor(500), 8);
        // thin label: coarse along its width only
        assert_eq!((coarse_factor(200), coarse_factor(14)), (8, 1));
    }

    #[test]
    fn test_exact_match_thin_wide_template() {
        let template = pattern(200, 14, 7);
        let screen = screen_with(&template, 123, 57, 480, 120);

        let (x, y, score) = NccMatcher::new().best_placement(&screen, &template).unwrap();
        assert_eq!((x, y), (123, 57));
        assert!(score > 0.999);
    }

    #[test]
    fn test_exact_match_small_template() {
        let template = pattern(16, 12, 1);
        let screen = screen_with(&template, 37, 21, 120, 90);

        let (x, y, score) = NccMatcher::new().best_placement(&screen, &template).unwrap();
        assert_eq!((x, y), (37, 21));
        assert!(score > 0.999);
    }

    #[test]
    fn test_exact_match_coarse_to_fine() {
        let template = pattern(48, 40, 2);
        let screen = screen_with(&template, 101, 77, 320, 240);

        let (x, y, score) = NccMatcher::new().best_placement(&screen, &template).unwrap();
        assert_eq!((x, y), (101, 77));
        assert!(score > 0.999);
    }

    #[test]
    fn test_threshold_and_focus_point() {
        let template = pattern(16, 16, 3);
        let screen = screen_with(&template, 50, 40, 120, 90);
        let image = Arc::new(
            ReferenceImage::from_image("btn", &image::DynamicImage::ImageLuma8(template))
                .with_focus_delta(10, -20),
        );

        let found = NccMatcher::new().find(&screen, &image).unwrap().unwrap();
        assert_eq!(found.focus_point(), (50 + 8 + 10, 40 + 8 - 20));

        let other = Arc::new(ReferenceImage::from_image(
            "other",
            &image::DynamicImage::ImageLuma8(pattern(16, 16, 4)),
        ));
        assert!(NccMatcher::new().find(&screen, &other).unwrap().is_none());
    }

    #[test]
    fn test_too_small_screens_never_match() {
        let template = pattern(16, 16, 5);
        let screen = screen_with(&template, 0, 0, 16, 16);
        assert!(NccMatcher::new().best_placement(&screen, &template).is_some());
        assert!(NccMatcher::new()
            .with_min_screen(720, 400)
            .best_placement(&screen, &template)
            .is_none());
        assert!(NccMatcher::new()
            .best_placement(&pattern(8, 8, 6), &template)
            .is_none());
    }
}
