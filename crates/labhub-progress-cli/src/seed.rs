//! Built-in "galaxy explorer" catalog: three categories walked as one chain.

use labhub_progress_core::{LabDraft, LabRef, PrerequisiteSet, ProgressError};

struct SeedLab {
    lab_ref: &'static str,
    name: &'static str,
    description: &'static str,
    category: &'static str,
    max_bonus_points: f64,
}

const GALAXY_LABS: [SeedLab; 15] = [
    SeedLab {
        lab_ref: "celestial-navigation",
        name: "Celestial Navigation",
        description: "Find your position from the stars using celestial coordinates.",
        category: "Earth",
        max_bonus_points: 10.0,
    },
    SeedLab {
        lab_ref: "seasons",
        name: "Seasons and Earth's Tilt",
        description: "Relate axial tilt and solar angle to the yearly cycle of seasons.",
        category: "Earth",
        max_bonus_points: 0.0,
    },
    SeedLab {
        lab_ref: "moon-phases",
        name: "Moon Phases",
        description: "Follow the lunar cycle and the geometry behind each phase.",
        category: "Earth",
        max_bonus_points: 5.0,
    },
    SeedLab {
        lab_ref: "eclipses",
        name: "Solar and Lunar Eclipses",
        description: "Predict eclipses and work with Saros cycles.",
        category: "Earth",
        max_bonus_points: 10.0,
    },
    SeedLab {
        lab_ref: "tides",
        name: "Tides and Tidal Forces",
        description: "Model how the Moon and Sun raise tides on Earth.",
        category: "Earth",
        max_bonus_points: 0.0,
    },
    SeedLab {
        lab_ref: "keplers-laws",
        name: "Kepler's Laws of Planetary Motion",
        description: "Compute orbital periods and distances from Kepler's three laws.",
        category: "Solar System",
        max_bonus_points: 15.0,
    },
    SeedLab {
        lab_ref: "roemers-delay",
        name: "Roemer's Speed of Light",
        description: "Estimate the speed of light from the timing of Jupiter's moons.",
        category: "Solar System",
        max_bonus_points: 10.0,
    },
    SeedLab {
        lab_ref: "planets",
        name: "Planetary Properties",
        description: "Compare physical and orbital properties across the planets.",
        category: "Solar System",
        max_bonus_points: 0.0,
    },
    SeedLab {
        lab_ref: "asteroids",
        name: "Asteroids and Near-Earth Objects",
        description: "Track asteroid orbits and assess impact risk.",
        category: "Solar System",
        max_bonus_points: 5.0,
    },
    SeedLab {
        lab_ref: "exoplanets",
        name: "Exoplanet Detection",
        description: "Detect planets around other stars with transits and radial velocity.",
        category: "Solar System",
        max_bonus_points: 20.0,
    },
    SeedLab {
        lab_ref: "parallax",
        name: "Stellar Parallax and Distance",
        description: "Measure distances to nearby stars with parallax.",
        category: "Stars",
        max_bonus_points: 10.0,
    },
    SeedLab {
        lab_ref: "hr-diagram",
        name: "Hertzsprung-Russell Diagram",
        description: "Classify stars on the HR diagram: main sequence, giants and dwarfs.",
        category: "Stars",
        max_bonus_points: 0.0,
    },
    SeedLab {
        lab_ref: "phoebe",
        name: "Binary Stars with PHOEBE",
        description: "Fit light curves of eclipsing binaries with PHOEBE.",
        category: "Stars",
        max_bonus_points: 25.0,
    },
    SeedLab {
        lab_ref: "spectroscopy",
        name: "Stellar Spectroscopy",
        description: "Read composition and temperature from stellar spectra.",
        category: "Stars",
        max_bonus_points: 15.0,
    },
    SeedLab {
        lab_ref: "stellar-evolution",
        name: "Stellar Evolution",
        description: "Trace a star's life from collapse to remnant.",
        category: "Stars",
        max_bonus_points: 20.0,
    },
];

/// Drafts for the built-in catalog; each lab requires the one before it.
///
/// # Errors
/// Returns [`ProgressError::Validation`] if a built-in ref is malformed.
pub fn galaxy_catalog() -> Result<Vec<LabDraft>, ProgressError> {
    let mut drafts: Vec<LabDraft> = Vec::with_capacity(GALAXY_LABS.len());
    for (order, seed) in (0_i64..).zip(GALAXY_LABS.iter()) {
        let mut draft = LabDraft::new(LabRef::parse(seed.lab_ref)?, seed.name, order);
        draft.description = seed.description.to_string();
        draft.category = seed.category.to_string();
        draft.has_bonus_challenge = seed.max_bonus_points > 0.0;
        draft.max_bonus_points = seed.max_bonus_points;
        if let Some(previous) = drafts.last() {
            draft.prerequisites = PrerequisiteSet::from_refs([previous.lab_ref.clone()]);
        }
        drafts.push(draft);
    }
    Ok(drafts)
}
