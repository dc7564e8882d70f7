use std::path::Path;

use figment::{
    providers::{Format, Json, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// A provider whose data was read and parsed eagerly.
///
/// Reading eagerly means a missing or malformed file is reported when the loader is built, rather than on the first
/// lookup.
pub struct ResolvedProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl ResolvedProvider {
    pub fn from_yaml<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::from_file::<Yaml, _>("YAML file", path)
    }

    pub fn from_json<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::from_file::<Json, _>("JSON file", path)
    }

    fn from_file<F, P>(kind: &'static str, path: P) -> Result<Self, Error>
    where
        F: Format,
        P: AsRef<Path>,
    {
        let file_data = std::fs::read_to_string(path.as_ref()).map_err(|e| e.to_string())?;

        let provider = F::string(&file_data);
        let data = provider.data()?;

        Ok(Self {
            data,
            metadata: Metadata::from(kind, path.as_ref()),
        })
    }
}

impl Provider for ResolvedProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
