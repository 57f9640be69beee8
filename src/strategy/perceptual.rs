//! Perceptual search over rendered text regions. Last resort: it ignores DOM
//! structure entirely and clicks where the text is drawn.

use crate::browser::{Locator, VisualRegion};

use super::similarity;

/// Minimum similarity for a region to count as the target.
const MATCH_THRESHOLD: f64 = 0.6;

/// Pick the rendered region that best matches `target` and return its center.
/// Ties go to the smaller region, which is the more specific one.
pub fn locate(target: &str, regions: &[VisualRegion]) -> Option<Locator> {
    if target.is_empty() {
        return None;
    }

    regions
        .iter()
        .filter(|r| r.width > 0.0 && r.height > 0.0)
        .map(|r| (similarity(target, &r.text), r))
        .filter(|(score, _)| *score >= MATCH_THRESHOLD)
        .min_by(|(sa, a), (sb, b)| {
            sb.total_cmp(sa)
                .then_with(|| (a.width * a.height).total_cmp(&(b.width * b.height)))
        })
        .map(|(_, region)| {
            let (x, y) = region.center();
            Locator::Point { x, y }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(text: &str, x: f64, y: f64, w: f64, h: f64) -> VisualRegion {
        VisualRegion {
            text: text.into(),
            x,
            y,
            width: w,
            height: h,
        }
    }

    #[test]
    fn test_exact_text_wins() {
        let regions = vec![
            region("Sign in to your account", 0.0, 0.0, 400.0, 40.0),
            region("Sign in", 300.0, 200.0, 80.0, 30.0),
        ];
        assert_eq!(
            locate("sign in", &regions),
            Some(Locator::Point { x: 340.0, y: 215.0 })
        );
    }

    #[test]
    fn test_tie_prefers_smaller_region() {
        let regions = vec![
            region("Checkout", 0.0, 0.0, 600.0, 100.0),
            region("Checkout", 10.0, 10.0, 20.0, 10.0),
        ];
        assert_eq!(
            locate("checkout", &regions),
            Some(Locator::Point { x: 20.0, y: 15.0 })
        );
    }

    #[test]
    fn test_no_similar_region() {
        let regions = vec![region("Privacy policy", 0.0, 0.0, 100.0, 20.0)];
        assert_eq!(locate("add to cart", &regions), None);
        assert_eq!(locate("", &regions), None);
    }

    #[test]
    fn test_zero_sized_regions_are_skipped() {
        let regions = vec![region("Continue", 5.0, 5.0, 0.0, 0.0)];
        assert_eq!(locate("continue", &regions), None);
    }
}
