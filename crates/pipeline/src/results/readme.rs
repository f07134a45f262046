//! Job-specific README shipped inside the results archive.

use chrono::{DateTime, Utc};
use minijinja::{context, Environment, UndefinedBehavior};
use refinery_core::{Job, JobMode};

use crate::error::StageError;

const README: &str = r#"# BilboMD Job Results

This directory contains the results for your {{ title }} BilboMD job.

- Job Title:  {{ title }}
- Job ID:  {{ id }}
- Mode:  {{ mode }} ({{ engine }})
- Submitted:  {{ submitted }}
- Completed:  {{ completed }}

## Contents

{% for line in inputs -%}
- {{ line }}
{% endfor -%}
- Minimized PDB file: {{ minimized }}
- Minimized PDB DAT file: {{ minimized }}.dat

The ensemble files are present in multiple copies, one for each ensemble size.

- Number of ensembles for this BilboMD run: {{ ensembles }}

- Ensemble PDB file(s):  ensemble_size_N_model.pdb
- Ensemble TXT file(s):  ensembles_size_N.txt
- Ensemble DAT file(s):  multi_state_model_N_1_1.dat

## The ensembles_size_N.txt files

Each file lists many possible N-state models, best first. A model starts with a
summary line (rank | chi^2 | chi^2 and the c1/c2 fit parameters) followed by one
line per state: conformation number, weight (with its average and standard
deviation across good-scoring models), the scored conformer file, and the
fraction of good-scoring models that contain it.

## The ensemble_size_N_model.pdb files

For N > 1 these are multi-model PDB files holding the conformers of the best
N-state model. For N = 1 the file is the single conformer that best fits your
SAXS data.
{% if feedback %}
## Feedback

An automated analysis of this run is in feedback.json.
{% endif %}"#;

/// Render the README for a finished job.
pub fn render_readme(
    job: &Job,
    ensembles: usize,
    minimized: &str,
    completed: DateTime<Utc>,
) -> Result<String, StageError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("README.md", README)?;
    let tmpl = env.get_template("README.md")?;
    Ok(tmpl.render(context! {
        title => job.title,
        id => job.id.to_string(),
        mode => job.mode.to_string(),
        engine => job.engine.to_string(),
        submitted => job.submitted_at.to_rfc2822(),
        completed => completed.to_rfc2822(),
        inputs => input_lines(job),
        minimized => minimized,
        ensembles => ensembles,
        feedback => job.feedback.is_some(),
    })?)
}

fn input_lines(job: &Job) -> Vec<String> {
    let origin = |generated: bool| if generated { "Generated" } else { "Original" };
    let mut lines = Vec::new();
    if let Some(pdb) = &job.pdb_file {
        lines.push(format!("Original PDB file: {pdb}"));
    }
    if let Some(pae) = &job.pae_file {
        lines.push(format!("Original PAE file: {pae}"));
    }
    let derived_coords = job.mode != JobMode::Crd;
    if let Some(crd) = &job.crd_file {
        lines.push(format!("{} CRD file: {crd}", origin(derived_coords)));
    }
    if let Some(psf) = &job.psf_file {
        lines.push(format!("{} PSF file: {psf}", origin(derived_coords)));
    }
    lines.push(format!("Original experimental SAXS data file: {}", job.data_file));
    if let Some(c) = &job.const_inp_file {
        lines.push(format!("{} const.inp file: {c}", origin(job.mode == JobMode::Auto)));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use refinery_core::{ExecutionBackend, MdEngine};

    #[test]
    fn readme_lists_inputs_and_ensemble_count() {
        let mut job = Job::new("lysozyme", JobMode::Pdb, MdEngine::Charmm, ExecutionBackend::Local, "saxs.dat");
        job.pdb_file = Some("lyz.pdb".into());
        job.crd_file = Some("bilbomd_pdb2crd.crd".into());

        let text = render_readme(&job, 4, "minimization_output.pdb", Utc::now()).unwrap();
        assert!(text.contains("results for your lysozyme BilboMD job"));
        assert!(text.contains("- Original PDB file: lyz.pdb"));
        assert!(text.contains("- Generated CRD file: bilbomd_pdb2crd.crd"));
        assert!(text.contains("Number of ensembles for this BilboMD run: 4"));
        assert!(!text.contains("## Feedback"));
    }
}
