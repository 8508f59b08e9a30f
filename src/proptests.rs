use std::sync::Arc;

use geo::{polygon, Rect};
use ndarray::Array2;
use proptest::prelude::*;

use crate::{CellClassifier, MemoryRaster, PixelizeTask, RasterGridSpec};

fn on_grid_line(value: f64, origin: f64, size: f64) -> bool {
    let steps = (value - origin) / size;
    (steps - steps.round()).abs() < 1e-6
}

prop_compose! {
    fn grid()(
        origin_x in -1e4..1e4f64,
        origin_y in -1e4..1e4f64,
        pixel_size_x in 0.05..50f64,
        pixel_size_y in 0.05..50f64,
    ) -> RasterGridSpec {
        RasterGridSpec::new(origin_x, origin_y, pixel_size_x, pixel_size_y).unwrap()
    }
}

prop_compose! {
    fn rect()(
        x in -1e4..1e4f64,
        y in -1e4..1e4f64,
        width in 0.0..500f64,
        height in 0.0..500f64,
    ) -> Rect<f64> {
        Rect::new((x, y), (x + width, y + height))
    }
}

prop_compose! {
    fn triangle()(
        points in proptest::collection::vec((0.0..12f64, 0.0..12f64), 3)
    ) -> geo::Polygon<f64> {
        polygon![
            (x: points[0].0, y: points[0].1),
            (x: points[1].0, y: points[1].1),
            (x: points[2].0, y: points[2].1),
        ]
    }
}

fn ramp_raster() -> Arc<MemoryRaster<f64>> {
    let values = Array2::from_shape_fn((12, 12), |(row, col)| ((row * 7 + col * 3) % 11) as f64);
    Arc::new(MemoryRaster::new(0., 0., 1., 1., vec![values]).unwrap())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn aligned_edges_sit_on_grid_lines(grid in grid(), rect in rect()) {
        let block = grid.align(rect);
        let (min, max) = (block.rect.min(), block.rect.max());
        prop_assert!(on_grid_line(min.x, grid.origin_x(), grid.pixel_size_x()));
        prop_assert!(on_grid_line(min.y, grid.origin_y(), grid.pixel_size_y()));
        prop_assert!(on_grid_line(max.x, grid.origin_x(), grid.pixel_size_x()));
        prop_assert!(on_grid_line(max.y, grid.origin_y(), grid.pixel_size_y()));
        prop_assert!(block.rect.width() <= rect.width() + 1e-6);
        prop_assert!(block.rect.height() <= rect.height() + 1e-6);
    }

    #[test]
    fn aligning_twice_changes_nothing(grid in grid(), rect in rect()) {
        let once = grid.align(rect);
        let twice = grid.align(once.rect);
        prop_assert_eq!(once.width, twice.width);
        prop_assert_eq!(once.height, twice.height);
        prop_assert!((once.rect.min().x - twice.rect.min().x).abs() < 1e-6);
        prop_assert!((once.rect.min().y - twice.rect.min().y).abs() < 1e-6);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn classification_is_deterministic(field in triangle()) {
        let raster = ramp_raster();
        let target = field.into();
        if let Some(classifier) = CellClassifier::prepare(raster.as_ref(), 1, &target).unwrap() {
            for (row, col) in classifier.block().cells() {
                prop_assert_eq!(
                    classifier.classify(row, col).unwrap(),
                    classifier.classify(row, col).unwrap()
                );
            }
        }
    }

    #[test]
    fn stats_ignore_worker_count(field in triangle()) {
        let run = |workers| {
            PixelizeTask::new(ramp_raster(), 1, field.clone())
                .workers(workers)
                .run()
                .completed()
                .unwrap()
                .stats
        };
        prop_assert_eq!(run(1), run(5));
    }
}
