//! Image grids and latent dumps written at epoch boundaries.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::error::{IntroVaeError, Result};

/// Columns of every image grid.
pub const GRID_COLUMNS: usize = 5;

/// `<prefix>_<name>_epoch<epoch>_iter<iters>.<ext>`.
///
/// ```rust
/// use introvae_rs::output::artifact_path;
///
/// let path = artifact_path("out/run", "sampled", 3, 120, "png");
/// assert_eq!(path.to_str(), Some("out/run_sampled_epoch3_iter120.png"));
/// ```
pub fn artifact_path(prefix: &str, name: &str, epoch: usize, iters: usize, ext: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}_{name}_epoch{epoch}_iter{iters}.{ext}"))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Tile `(n, C, H, W)` images with values in `[0, 1]` into a
/// `(rows * H, columns * W, C)` `u8` tensor, row-major, padding with black.
pub fn tile_images(images: &Tensor, columns: usize) -> Result<Tensor> {
    let (n, c, h, w) = images.dims4()?;
    if n == 0 || columns == 0 {
        return Err(IntroVaeError::training("cannot tile an empty image batch"));
    }
    let columns = columns.min(n);
    let rows = n.div_ceil(columns);

    let mut images = images.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let missing = rows * columns - n;
    if missing > 0 {
        let pad = Tensor::zeros((missing, c, h, w), DType::F32, &Device::Cpu)?;
        images = Tensor::cat(&[&images, &pad], 0)?;
    }

    let pixels = (images.clamp(0f32, 1f32)? * 255.0)?.round()?.to_dtype(DType::U8)?;
    Ok(pixels
        .reshape((rows, columns, c, h, w))?
        .permute((0, 3, 1, 4, 2))?
        .reshape((rows * h, columns * w, c))?)
}

/// Write `images` as a PNG grid with `columns` images per row.
///
/// One-channel batches become grayscale PNGs, three-channel batches RGB.
pub fn save_image_grid<P: AsRef<Path>>(images: &Tensor, columns: usize, path: P) -> Result<()> {
    let path = path.as_ref();
    let grid = tile_images(images, columns)?;
    let (height, width, channels) = grid.dims3()?;
    let data = grid.flatten_all()?.to_vec1::<u8>()?;
    let (width, height) = (width as u32, height as u32);

    ensure_parent(path)?;
    let built = match channels {
        1 => image::GrayImage::from_raw(width, height, data).map(|img| img.save(path)),
        3 => image::RgbImage::from_raw(width, height, data).map(|img| img.save(path)),
        other => {
            return Err(IntroVaeError::training(format!(
                "cannot write {other}-channel images"
            )))
        }
    };
    built.ok_or_else(|| IntroVaeError::training("image buffer does not match its dimensions"))??;
    Ok(())
}

/// Write a latent matrix as a `.npy` file.
pub fn save_latent<P: AsRef<Path>>(latent: &Tensor, path: P) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    latent.to_device(&Device::Cpu)?.write_npy(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_layout() {
        // Image i is a 1x2 strip of value i / 10.
        let data: Vec<f32> = (0..3).flat_map(|i| [i as f32 / 10.0; 2]).collect();
        let images = Tensor::from_vec(data, (3, 1, 1, 2), &Device::Cpu).unwrap();

        let grid = tile_images(&images, 2).unwrap();
        assert_eq!(grid.dims(), &[2, 4, 1]);
        let values: Vec<u8> = grid.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![0, 0, 26, 26, 51, 51, 0, 0]);
    }

    #[test]
    fn test_tile_clamps_out_of_range() {
        let images = Tensor::new(&[[[[-1f32, 2.0]]]], &Device::Cpu).unwrap();
        let values: Vec<u8> = tile_images(&images, GRID_COLUMNS)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(values, vec![0, 255]);
    }

    #[test]
    fn test_save_grids() {
        let dir = tempfile::TempDir::new().unwrap();
        let gray = Tensor::rand(0f32, 1f32, (10, 1, 4, 4), &Device::Cpu).unwrap();
        let rgb = Tensor::rand(0f32, 1f32, (7, 3, 4, 6), &Device::Cpu).unwrap();

        let gray_path = dir.path().join("nested").join("gray.png");
        save_image_grid(&gray, GRID_COLUMNS, &gray_path).unwrap();
        let img = image::open(&gray_path).unwrap();
        assert_eq!((img.width(), img.height()), (20, 8));

        let rgb_path = dir.path().join("rgb.png");
        save_image_grid(&rgb, GRID_COLUMNS, &rgb_path).unwrap();
        let img = image::open(&rgb_path).unwrap();
        assert_eq!((img.width(), img.height()), (30, 8));

        let bad = Tensor::zeros((2, 2, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(save_image_grid(&bad, GRID_COLUMNS, dir.path().join("bad.png")).is_err());
    }

    #[test]
    fn test_save_latent() {
        let dir = tempfile::TempDir::new().unwrap();
        let latent = Tensor::new(&[[0.5f32, -1.0], [2.0, 3.0]], &Device::Cpu).unwrap();
        let path = artifact_path(
            dir.path().join("run").to_str().unwrap(),
            "test_mean",
            1,
            10,
            "npy",
        );
        save_latent(&latent, &path).unwrap();
        assert!(path.ends_with("run_test_mean_epoch1_iter10.npy"));

        let loaded = Tensor::read_npy(&path).unwrap();
        assert_eq!(loaded.to_vec2::<f32>().unwrap(), vec![vec![0.5, -1.0], vec![2.0, 3.0]]);
    }
}
