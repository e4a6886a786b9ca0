//! Static function-profile document: one record per function in the target,
//! produced ahead of time by the introspection tooling.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AdvisorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callsite {
    #[serde(rename = "Src")]
    pub src: String,
    #[serde(rename = "Dst")]
    pub dst: String,
}

/// Static description of one function. Identity is `name`, assumed unique
/// within a target binary. Line numbers are signed because the tooling emits
/// -1 for functions it could not locate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionProfile {
    #[serde(rename = "functionName")]
    pub name: String,
    #[serde(rename = "functionSourceFile")]
    pub source_file: String,
    #[serde(rename = "linkageType")]
    pub linkage_type: String,
    #[serde(rename = "functionLinenumber")]
    pub line_begin: i64,
    #[serde(rename = "functionLinenumberEnd")]
    pub line_end: i64,
    #[serde(rename = "functionDepth")]
    pub function_depth: u32,
    #[serde(rename = "returnType")]
    pub return_type: String,
    #[serde(rename = "argCount")]
    pub arg_count: u32,
    #[serde(rename = "argTypes")]
    pub arg_types: Vec<String>,
    #[serde(rename = "constantsTouched")]
    pub constants_touched: Vec<String>,
    #[serde(rename = "argNames")]
    pub arg_names: Vec<String>,
    #[serde(rename = "BBCount")]
    pub bb_count: u32,
    #[serde(rename = "ICount")]
    pub instruction_count: u32,
    #[serde(rename = "EdgeCount")]
    pub edge_count: u32,
    #[serde(rename = "CyclomaticComplexity")]
    pub cyclomatic_complexity: u32,
    #[serde(rename = "functionsReached")]
    pub functions_reached: Vec<String>,
    #[serde(rename = "functionUses")]
    pub function_uses: u32,
    #[serde(rename = "BranchProfiles")]
    pub branch_profiles: Vec<String>,
    #[serde(rename = "Callsites")]
    pub callsites: Vec<Callsite>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawAllFunctions {
    #[serde(rename = "Function list name")]
    list_name: String,
    #[serde(rename = "Elements")]
    elements: Vec<FunctionProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawProgramProfile {
    #[serde(rename = "Fuzzer filename")]
    fuzzer_filename: String,
    #[serde(rename = "All functions")]
    all_functions: RawAllFunctions,
}

/// Parsed profile document with its functions shared behind `Arc` so call
/// tree nodes can point at them without copying.
#[derive(Debug, Clone)]
pub struct ProgramProfile {
    pub fuzzer_filename: String,
    pub function_list_name: String,
    pub functions: Vec<Arc<FunctionProfile>>,
}

pub type ProfileIndex = HashMap<String, Arc<FunctionProfile>>;

impl ProgramProfile {
    /// By-name lookup table. Later records win on duplicate names, matching
    /// the document order semantics of the tooling that emits them.
    pub fn index(&self) -> ProfileIndex {
        self.functions
            .iter()
            .map(|f| (f.name.clone(), f.clone()))
            .collect()
    }
}

pub fn parse_profile(path: &Path) -> Result<ProgramProfile, AdvisorError> {
    let data = std::fs::read_to_string(path)?;
    parse_profile_str(&data)
}

pub fn parse_profile_str(data: &str) -> Result<ProgramProfile, AdvisorError> {
    let raw: RawProgramProfile = serde_yaml::from_str(data)?;
    Ok(ProgramProfile {
        fuzzer_filename: raw.fuzzer_filename,
        function_list_name: raw.all_functions.list_name,
        functions: raw
            .all_functions
            .elements
            .into_iter()
            .map(Arc::new)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
Fuzzer filename: /src/parse_fuzzer.c
All functions:
  Function list name: All functions
  Elements:
    - functionName: LLVMFuzzerTestOneInput
      functionSourceFile: /src/parse_fuzzer.c
      functionLinenumber: 10
      functionLinenumberEnd: 20
      returnType: int
      argCount: 2
      argTypes: ['const uint8_t *', 'size_t']
      argNames: ['data', 'size']
      BBCount: 4
      ICount: 31
      EdgeCount: 5
      CyclomaticComplexity: 2
      functionsReached: ['parse_header']
      functionUses: 0
      Callsites:
        - Src: 'LLVMFuzzerTestOneInput'
          Dst: 'parse_header'
    - functionName: parse_header
      functionSourceFile: /src/parser.c
      functionLinenumber: 42
      functionLinenumberEnd: 96
      returnType: int
      argCount: 1
      CyclomaticComplexity: 7
      functionUses: 3
"#;

    #[test]
    fn parses_document_and_fields() {
        let profile = parse_profile_str(SAMPLE).unwrap();
        assert_eq!(profile.fuzzer_filename, "/src/parse_fuzzer.c");
        assert_eq!(profile.functions.len(), 2);

        let entry = &profile.functions[0];
        assert_eq!(entry.name, "LLVMFuzzerTestOneInput");
        assert_eq!(entry.arg_types.len(), 2);
        assert_eq!(entry.callsites[0].dst, "parse_header");
        assert_eq!(entry.cyclomatic_complexity, 2);
    }

    #[test]
    fn missing_fields_default() {
        let profile = parse_profile_str(SAMPLE).unwrap();
        let header = &profile.functions[1];
        assert!(header.arg_types.is_empty());
        assert!(header.callsites.is_empty());
        assert_eq!(header.bb_count, 0);
    }

    #[test]
    fn index_resolves_by_name() {
        let profile = parse_profile_str(SAMPLE).unwrap();
        let index = profile.index();
        assert_eq!(index["parse_header"].cyclomatic_complexity, 7);
        assert!(!index.contains_key("unknown_function"));
    }

    #[test]
    fn rejects_malformed_document() {
        assert!(parse_profile_str("All functions: [not, a, mapping").is_err());
    }
}
