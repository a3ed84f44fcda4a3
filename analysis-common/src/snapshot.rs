use crate::vecmath::Vec3;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A particle population category with a shared reference mass.
///
/// Gas is the primary (hydrodynamic) dynamical tracer and carries per-particle
/// densities; stars are the secondary supporting tracer.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Species {
    Gas,
    Stars,
}

impl Species {
    /// Whether this species carries per-particle hydrodynamic densities.
    pub fn is_hydro(self) -> bool {
        matches!(self, Species::Gas)
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Species::Gas => write!(f, "gas"),
            Species::Stars => write!(f, "stars"),
        }
    }
}

/// Per-species particle arrays. Owned by the snapshot, never mutated by the
/// analysis pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesData {
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    /// Per-particle density; empty for non-hydrodynamic species.
    densities: Vec<f64>,
    ids: Vec<u64>,
}

impl SpeciesData {
    /// Builds the array bundle, checking that all per-particle arrays agree
    /// in length. Densities may be empty (non-hydro species).
    pub fn new(
        positions: Vec<Vec3>,
        velocities: Vec<Vec3>,
        densities: Vec<f64>,
        ids: Vec<u64>,
    ) -> Result<Self> {
        let n = positions.len();
        if velocities.len() != n {
            anyhow::bail!(
                "velocity array length {} does not match {} positions",
                velocities.len(),
                n
            );
        }
        if !densities.is_empty() && densities.len() != n {
            anyhow::bail!(
                "density array length {} does not match {} positions",
                densities.len(),
                n
            );
        }
        if ids.len() != n {
            anyhow::bail!("id array length {} does not match {} positions", ids.len(), n);
        }
        Ok(Self {
            positions,
            velocities,
            densities,
            ids,
        })
    }

    /// An empty particle set (valid: a species may be entirely absent from a
    /// region of the simulation).
    pub fn empty() -> Self {
        Self {
            positions: Vec::new(),
            velocities: Vec::new(),
            densities: Vec::new(),
            ids: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn velocities(&self) -> &[Vec3] {
        &self.velocities
    }

    /// Per-particle densities, or an empty slice for non-hydro species.
    pub fn densities(&self) -> &[f64] {
        &self.densities
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn has_densities(&self) -> bool {
        !self.densities.is_empty()
    }
}

/// Header fields shared by every particle group in one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Simulation time of this snapshot, in the simulation's time unit.
    pub time: f64,
    /// Side length of the periodic box, kpc.
    pub box_size: f64,
    /// Reference particle mass per species, M_sun.
    pub reference_masses: BTreeMap<Species, f64>,
}

impl SnapshotHeader {
    pub fn reference_mass(&self, species: Species) -> Result<f64> {
        self.reference_masses
            .get(&species)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no reference mass for species '{}' in header", species))
    }
}

/// One snapshot's worth of particle state: a header plus per-species arrays.
///
/// This is the in-memory view the analysis pipeline consumes; decoding the
/// on-disk snapshot format into it is an adapter concern outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    pub header: SnapshotHeader,
    species: BTreeMap<Species, SpeciesData>,
}

impl SnapshotData {
    pub fn new(header: SnapshotHeader) -> Self {
        Self {
            header,
            species: BTreeMap::new(),
        }
    }

    /// Attaches a particle group. The header must already carry a reference
    /// mass for the species, and hydro species must carry densities.
    pub fn insert_species(&mut self, species: Species, data: SpeciesData) -> Result<()> {
        self.header.reference_mass(species)?;
        if species.is_hydro() && !data.is_empty() && !data.has_densities() {
            anyhow::bail!("hydrodynamic species '{}' is missing density data", species);
        }
        self.species.insert(species, data);
        Ok(())
    }

    pub fn species(&self, species: Species) -> Option<&SpeciesData> {
        self.species.get(&species)
    }

    pub fn species_present(&self) -> impl Iterator<Item = Species> + '_ {
        self.species.keys().copied()
    }

    /// Total particle count across all species.
    pub fn total_particles(&self) -> usize {
        self.species.values().map(|s| s.len()).sum()
    }
}
