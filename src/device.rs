use crate::error::DeviceError;
use log::debug;
use std::io::{BufRead, Write};

/// Label recorded when the operator skips the interactive prompt.
pub const UNKNOWN_DEVICE: &str = "UNKNOWN";

/// Ordered list of known device labels. Positions are 1-based when shown
/// to or read from the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCatalog {
    names: Vec<String>,
}

impl DeviceCatalog {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Looks up a 1-based position.
    pub fn by_index(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
    }

    pub fn menu(&self) -> String {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| format!("  {}) {}\n", i + 1, name))
            .collect()
    }
}

/// Picks the device label for this run: explicit flag first, then the
/// positional selector, then the interactive prompt.
pub fn resolve<R: BufRead, W: Write>(
    catalog: &DeviceCatalog,
    flag: Option<&str>,
    selector: Option<&str>,
    input: &mut R,
    output: &mut W,
) -> Result<String, DeviceError> {
    if let Some(name) = flag {
        debug!("Device taken from --device: {}", name);
        return by_name(catalog, name);
    }

    if let Some(selector) = selector {
        debug!("Device taken from positional selector: {}", selector);
        return from_selector(catalog, selector);
    }

    prompt(catalog, input, output)
}

/// Resolves a positional selector: digits are a 1-based index, anything
/// else must be an exact catalog name.
pub fn from_selector(catalog: &DeviceCatalog, selector: &str) -> Result<String, DeviceError> {
    if is_numeric(selector) {
        selector
            .parse::<usize>()
            .ok()
            .and_then(|index| catalog.by_index(index))
            .map(str::to_string)
            .ok_or_else(|| DeviceError::IndexOutOfRange {
                index: selector.to_string(),
                len: catalog.len(),
            })
    } else {
        by_name(catalog, selector)
    }
}

fn by_name(catalog: &DeviceCatalog, name: &str) -> Result<String, DeviceError> {
    if catalog.contains(name) {
        Ok(name.to_string())
    } else {
        Err(DeviceError::UnknownName {
            name: name.to_string(),
            valid: catalog.names().to_vec(),
        })
    }
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Shows the numbered menu until the operator gives a valid answer.
/// An empty line selects [`UNKNOWN_DEVICE`].
pub fn prompt<R: BufRead, W: Write>(
    catalog: &DeviceCatalog,
    input: &mut R,
    output: &mut W,
) -> Result<String, DeviceError> {
    loop {
        writeln!(output, "Select device:")?;
        write!(output, "{}", catalog.menu())?;
        write!(output, "Device number or name (Enter for {}): ", UNKNOWN_DEVICE)?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Err(DeviceError::InputClosed);
        }

        let answer = line.trim();
        if answer.is_empty() {
            return Ok(UNKNOWN_DEVICE.to_string());
        }

        match from_selector(catalog, answer) {
            Ok(device) => return Ok(device),
            Err(_) => writeln!(output, "Invalid selection: {}", answer)?,
        }
    }
}
