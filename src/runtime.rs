//! Language-runtime selection for sandbox base images.
//!
//! Each benchmark repository pins the Python interpreter its era of code
//! expects; old Django releases will not even import under a modern
//! interpreter. The mapping is keyed on `(repo, version)` with version
//! thresholds per repository and a global default of 3.9.

/// Default interpreter for repositories without a dedicated row.
pub const DEFAULT_PYTHON: &str = "3.9";

/// Resolve the Python version to provision for `(repo, version)`.
///
/// The version tag is interpreted numerically; unparseable tags fall into
/// the lowest bracket, matching how the corpus labels pre-release eras.
pub fn python_version(repo: &str, version: &str) -> &'static str {
    let v = parse_version(version);

    match repo {
        "django/django" => {
            if v < 3.0 {
                "3.5"
            } else if v < 4.0 {
                "3.6"
            } else if v < 4.1 {
                "3.8"
            } else if v < 5.0 {
                "3.9"
            } else {
                "3.11"
            }
        }
        "astropy/astropy" => {
            if v < 3.0 {
                "3.6"
            } else if v < 5.3 {
                "3.9"
            } else {
                "3.10"
            }
        }
        "matplotlib/matplotlib" => {
            if v < 3.0 {
                "3.5"
            } else if v < 3.1 {
                "3.7"
            } else if v < 3.5 {
                "3.8"
            } else {
                "3.11"
            }
        }
        "scikit-learn/scikit-learn" => {
            if v < 1.0 {
                "3.6"
            } else {
                "3.9"
            }
        }
        "pallets/flask" => {
            if v < 2.1 {
                "3.9"
            } else if v < 2.2 {
                "3.10"
            } else {
                "3.11"
            }
        }
        "pydata/xarray" => "3.10",
        _ => DEFAULT_PYTHON,
    }
}

fn parse_version(version: &str) -> f64 {
    version.trim().parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn django_thresholds() {
        assert_eq!(python_version("django/django", "1.11"), "3.5");
        assert_eq!(python_version("django/django", "3.0"), "3.6");
        assert_eq!(python_version("django/django", "4.0"), "3.8");
        assert_eq!(python_version("django/django", "4.1"), "3.9");
        assert_eq!(python_version("django/django", "5.0"), "3.11");
    }

    #[test]
    fn astropy_and_matplotlib_thresholds() {
        assert_eq!(python_version("astropy/astropy", "1.3"), "3.6");
        assert_eq!(python_version("astropy/astropy", "4.2"), "3.9");
        assert_eq!(python_version("astropy/astropy", "5.3"), "3.10");
        assert_eq!(python_version("matplotlib/matplotlib", "2.2"), "3.5");
        assert_eq!(python_version("matplotlib/matplotlib", "3.0"), "3.7");
        assert_eq!(python_version("matplotlib/matplotlib", "3.4"), "3.8");
        assert_eq!(python_version("matplotlib/matplotlib", "3.7"), "3.11");
    }

    #[test]
    fn fixed_and_default_rows() {
        assert_eq!(python_version("pydata/xarray", "2022.03"), "3.10");
        assert_eq!(python_version("scikit-learn/scikit-learn", "0.22"), "3.6");
        assert_eq!(python_version("scikit-learn/scikit-learn", "1.3"), "3.9");
        assert_eq!(python_version("pallets/flask", "2.0"), "3.9");
        assert_eq!(python_version("pallets/flask", "2.1"), "3.10");
        assert_eq!(python_version("pallets/flask", "2.3"), "3.11");
        assert_eq!(python_version("psf/requests", "2.26"), DEFAULT_PYTHON);
    }

    #[test]
    fn unparseable_version_uses_lowest_bracket() {
        assert_eq!(python_version("django/django", ""), "3.5");
        assert_eq!(python_version("django/django", "dev"), "3.5");
        // Deterministic: same inputs, same output.
        assert_eq!(
            python_version("sympy/sympy", "1.11"),
            python_version("sympy/sympy", "1.11")
        );
    }
}
