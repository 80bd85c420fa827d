use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::error::TryOnError;

/// Decoded inputs written to a private directory for one request.
/// Dropping the value removes the directory and both files.
pub struct StagedImages {
    dir: TempDir,
    person: PathBuf,
    garment: PathBuf,
}

impl StagedImages {
    pub fn write(person: &DynamicImage, garment: &DynamicImage) -> Result<Self, TryOnError> {
        let dir = tempfile::Builder::new().prefix("tryon-").tempdir()?;
        let person_path = dir.path().join("person.png");
        let garment_path = dir.path().join("garment.png");

        save_png(person, &person_path)?;
        save_png(garment, &garment_path)?;

        Ok(StagedImages {
            dir,
            person: person_path,
            garment: garment_path,
        })
    }

    pub fn person(&self) -> &Path {
        &self.person
    }

    pub fn garment(&self) -> &Path {
        &self.garment
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

fn save_png(img: &DynamicImage, path: &Path) -> Result<(), TryOnError> {
    img.save_with_format(path, ImageFormat::Png)
        .map_err(|e| TryOnError::Internal(format!("failed to stage {}: {}", path.display(), e)))
}
