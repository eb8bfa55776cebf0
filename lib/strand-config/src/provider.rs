use std::path::Path;

use figment::{
    providers::{Data, Json, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// Supported configuration file formats.
#[derive(Clone, Copy, Debug)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    fn name(&self) -> &'static str {
        match self {
            Self::Yaml => "YAML file",
            Self::Json => "JSON file",
        }
    }
}

/// A configuration file that has been read and parsed eagerly.
///
/// `figment` file providers read lazily, which would defer I/O and parse errors until the first lookup. Reading the
/// file up front lets the loader fail (or skip the file) at the point the file is added.
pub struct FileProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl FileProvider {
    pub fn from_path<P>(path: P, format: FileFormat) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| e.to_string())?;
        let data = match format {
            FileFormat::Yaml => Data::<Yaml>::string(&contents).data()?,
            FileFormat::Json => Data::<Json>::string(&contents).data()?,
        };

        Ok(Self {
            data,
            metadata: Metadata::from(format.name(), path.as_ref()),
        })
    }
}

impl Provider for FileProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
