// THEORY:
// The `tiling` module prepares a full-resolution frame for a fixed-size detector.
// The frame is cropped to a multiple of the tile factor, cut into T x T equal tiles
// in row-major order, and each tile is resized and packed into one contiguous
// batch buffer the inference engine can consume as-is.
//
// Packing is embarrassingly parallel: every tile owns a disjoint slice of the
// batch buffer, so the tiles are split across scoped worker threads, one group per
// core, with no locking at all.

use image::RgbImage;
use image::imageops::{self, FilterType};
use std::path::{Path, PathBuf};

use crate::error::PostprocessError;

pub const CHANNELS: usize = 3;

/// The tiles of one frame and the geometry they were cut with.
#[derive(Debug, Clone)]
pub struct TileSet {
    pub tile_factor: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Frame size after cropping to a multiple of the tile factor.
    pub width: u32,
    pub height: u32,
    /// Row-major, `tile_factor * tile_factor` entries.
    pub tiles: Vec<RgbImage>,
}

impl TileSet {
    pub fn tile(&self, row: u32, col: u32) -> Option<&RgbImage> {
        self.tiles.get((row * self.tile_factor + col) as usize)
    }

    /// Writes every tile as `tile_<row>_<col>.png` under `dir`.
    pub fn save(&self, dir: &Path) -> Result<Vec<PathBuf>, image::ImageError> {
        std::fs::create_dir_all(dir)?;
        let mut paths = Vec::with_capacity(self.tiles.len());
        for (i, tile) in self.tiles.iter().enumerate() {
            let row = i as u32 / self.tile_factor;
            let col = i as u32 % self.tile_factor;
            let path = dir.join(format!("tile_{row}_{col}.png"));
            tile.save(&path)?;
            paths.push(path);
        }
        tracing::info!(count = paths.len(), dir = %dir.display(), "tiles saved");
        Ok(paths)
    }
}

/// Cuts `image` into `tile_factor x tile_factor` equal tiles.
///
/// Rows and columns that do not divide evenly are dropped from the right and
/// bottom edges.
pub fn split_into_tiles(image: &RgbImage, tile_factor: u32) -> Result<TileSet, PostprocessError> {
    let (w, h) = image.dimensions();
    if tile_factor == 0 || w < tile_factor || h < tile_factor {
        return Err(PostprocessError::ImageTooSmall {
            width: w,
            height: h,
            factor: tile_factor,
        });
    }

    let width = w - w % tile_factor;
    let height = h - h % tile_factor;
    let tile_width = width / tile_factor;
    let tile_height = height / tile_factor;

    let tiles = (0..tile_factor)
        .flat_map(|row| (0..tile_factor).map(move |col| (row, col)))
        .map(|(row, col)| {
            imageops::crop_imm(image, col * tile_width, row * tile_height, tile_width, tile_height)
                .to_image()
        })
        .collect();

    Ok(TileSet {
        tile_factor,
        tile_width,
        tile_height,
        width,
        height,
        tiles,
    })
}

/// Normalized tiles packed as `[batch, 3, height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TileBatch {
    pub batch: usize,
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl TileBatch {
    pub fn shape(&self) -> [usize; 4] {
        [self.batch, CHANNELS, self.height as usize, self.width as usize]
    }

    fn tile_len(&self) -> usize {
        CHANNELS * self.width as usize * self.height as usize
    }

    /// The CHW planes of one tile.
    pub fn tile(&self, index: usize) -> Option<&[f32]> {
        let len = self.tile_len();
        self.data.get(index * len..(index + 1) * len)
    }
}

/// Resizes every tile to the model input and writes its planes, scaled to
/// [0, 1], into one batch buffer.
pub fn prepare_batch(tiles: &[RgbImage], input_width: u32, input_height: u32) -> TileBatch {
    let tile_len = CHANNELS * input_width as usize * input_height as usize;
    let mut data = vec![0.0_f32; tiles.len() * tile_len];

    if !tiles.is_empty() && tile_len > 0 {
        let workers = num_cpus::get().clamp(1, tiles.len());
        let per_worker = tiles.len().div_ceil(workers);

        std::thread::scope(|scope| {
            for (group, out) in tiles
                .chunks(per_worker)
                .zip(data.chunks_mut(per_worker * tile_len))
            {
                scope.spawn(move || {
                    for (tile, planes) in group.iter().zip(out.chunks_mut(tile_len)) {
                        write_planes(tile, input_width, input_height, planes);
                    }
                });
            }
        });
    }

    TileBatch {
        batch: tiles.len(),
        width: input_width,
        height: input_height,
        data,
    }
}

fn write_planes(tile: &RgbImage, width: u32, height: u32, planes: &mut [f32]) {
    let resized;
    let source = if tile.dimensions() == (width, height) {
        tile
    } else {
        resized = imageops::resize(tile, width, height, FilterType::Triangle);
        &resized
    };

    let plane = width as usize * height as usize;
    for (i, pixel) in source.pixels().enumerate() {
        for c in 0..CHANNELS {
            planes[c * plane + i] = pixel[c] as f32 / 255.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgb;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 7]))
    }

    #[test]
    fn split_crops_to_a_multiple_of_the_factor() {
        let set = split_into_tiles(&gradient(10, 9), 4).unwrap();
        assert_eq!((set.width, set.height), (8, 8));
        assert_eq!((set.tile_width, set.tile_height), (2, 2));
        assert_eq!(set.tiles.len(), 16);
    }

    #[test]
    fn tiles_are_row_major() {
        let set = split_into_tiles(&gradient(8, 8), 4).unwrap();
        // Row 1, column 2 starts at pixel (4, 2).
        let tile = set.tile(1, 2).unwrap();
        assert_eq!(tile.get_pixel(0, 0), &Rgb([4, 2, 7]));
        assert_eq!(set.tiles[6].get_pixel(1, 1), &Rgb([5, 3, 7]));
    }

    #[test]
    fn tiny_image_is_rejected() {
        assert!(matches!(
            split_into_tiles(&gradient(3, 10), 4),
            Err(PostprocessError::ImageTooSmall { width: 3, .. })
        ));
        assert!(split_into_tiles(&gradient(3, 3), 0).is_err());
    }

    #[test]
    fn batch_is_chw_and_normalized() {
        let a = RgbImage::from_pixel(2, 2, Rgb([255, 0, 51]));
        let b = RgbImage::from_pixel(2, 2, Rgb([0, 102, 255]));
        let batch = prepare_batch(&[a, b], 2, 2);

        assert_eq!(batch.shape(), [2, 3, 2, 2]);
        let first = batch.tile(0).unwrap();
        assert_relative_eq!(first[0], 1.0);
        assert_relative_eq!(first[4], 0.0);
        assert_relative_eq!(first[8], 0.2);
        let second = batch.tile(1).unwrap();
        assert_relative_eq!(second[3], 0.0);
        assert_relative_eq!(second[7], 0.4);
        assert_relative_eq!(second[11], 1.0);
        assert!(batch.tile(2).is_none());
    }

    #[test]
    fn batch_resizes_to_model_input() {
        let tiles = vec![RgbImage::from_pixel(8, 4, Rgb([255, 255, 255])); 5];
        let batch = prepare_batch(&tiles, 4, 4);
        assert_eq!(batch.data.len(), 5 * 3 * 16);
        assert!(batch.data.iter().all(|v| (*v - 1.0).abs() < 0.01));
    }

    #[test]
    fn tiles_save_with_row_and_column_names() {
        let dir = std::env::temp_dir().join(format!("stage_traverse_tiles_{}", std::process::id()));
        let set = split_into_tiles(&gradient(4, 4), 2).unwrap();
        let paths = set.save(&dir).unwrap();
        assert_eq!(paths.len(), 4);
        assert!(paths[1].ends_with("tile_0_1.png"));
        assert!(paths.iter().all(|p| p.exists()));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
