use alloy::dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier};
use alloy::json_abi::{Function, JsonAbi};
use alloy::primitives::Bytes;
use serde_json::Value;

use crate::error::{MintError, Result};

/// The target function together with its arguments, validated against the
/// function's parameter list when the configuration is loaded.
#[derive(Debug, Clone)]
pub struct MintCall {
    function: Function,
    args: Vec<DynSolValue>,
    calldata: Bytes,
}

impl MintCall {
    /// Builds a call from a human readable signature such as
    /// `function mint(uint256 _count) payable`.
    pub fn from_signature(signature: &str, args: &[Value]) -> Result<Self> {
        let function = Function::parse(signature)
            .map_err(|e| MintError::Abi(format!("invalid signature `{signature}`: {e}")))?;
        Self::new(function, args)
    }

    /// Picks `name` out of a JSON ABI. Overloads are resolved by arity.
    pub fn from_abi_json(abi_json: &str, name: &str, args: &[Value]) -> Result<Self> {
        let abi: JsonAbi = serde_json::from_str(abi_json)
            .map_err(|e| MintError::Abi(format!("invalid ABI JSON: {e}")))?;
        let candidates = abi
            .function(name)
            .ok_or_else(|| MintError::Abi(format!("function `{name}` not found in ABI")))?;
        let function = candidates
            .iter()
            .find(|f| f.inputs.len() == args.len())
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| MintError::Abi(format!("function `{name}` not found in ABI")))?;
        Self::new(function, args)
    }

    pub fn new(function: Function, args: &[Value]) -> Result<Self> {
        if function.inputs.len() != args.len() {
            return Err(MintError::Abi(format!(
                "{} expects {} arguments, got {}",
                function.signature(),
                function.inputs.len(),
                args.len()
            )));
        }

        let mut values = Vec::with_capacity(args.len());
        for (param, arg) in function.inputs.iter().zip(args) {
            let ty: DynSolType = param
                .resolve()
                .map_err(|e| MintError::Abi(format!("unsupported parameter type {}: {e}", param.ty)))?;
            values.push(coerce(&ty, arg)?);
        }

        let calldata = function
            .abi_encode_input(&values)
            .map_err(|e| MintError::Abi(format!("failed to encode {}: {e}", function.name)))?;

        Ok(Self {
            function,
            args: values,
            calldata: calldata.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn signature(&self) -> String {
        self.function.signature()
    }

    pub fn args(&self) -> &[DynSolValue] {
        &self.args
    }

    pub fn calldata(&self) -> Bytes {
        self.calldata.clone()
    }
}

fn coerce(ty: &DynSolType, value: &Value) -> Result<DynSolValue> {
    let literal = literal(value)?;
    ty.coerce_str(&literal)
        .map_err(|e| MintError::Abi(format!("argument `{literal}` is not a valid {ty}: {e}")))
}

/// Renders a JSON argument in the textual form `DynSolType::coerce_str` accepts.
fn literal(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Array(items) => {
            let inner = items.iter().map(literal).collect::<Result<Vec<_>>>()?;
            Ok(format!("[{}]", inner.join(",")))
        }
        other => Err(MintError::Abi(format!("unsupported argument {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use serde_json::json;

    #[test]
    fn encodes_default_mint_signature() {
        let call =
            MintCall::from_signature("function mint(uint256 _count) payable", &[json!("2")]).unwrap();
        assert_eq!(call.name(), "mint");
        assert_eq!(call.args(), &[DynSolValue::Uint(U256::from(2), 256)]);
        // selector + one word
        assert_eq!(call.calldata().len(), 4 + 32);
    }

    #[test]
    fn rejects_arity_mismatch() {
        let err = MintCall::from_signature("function mint(uint256 _count) payable", &[])
            .unwrap_err();
        assert!(matches!(err, MintError::Abi(msg) if msg.contains("expects 1 arguments")));
    }

    #[test]
    fn rejects_type_mismatch() {
        let err = MintCall::from_signature(
            "function mint(address to, uint256 amount)",
            &[json!("not-an-address"), json!(1)],
        )
        .unwrap_err();
        assert!(matches!(err, MintError::Abi(_)));
    }

    #[test]
    fn resolves_function_from_json_abi() {
        let abi = r#"[{"type":"function","name":"publicMint","stateMutability":"payable",
            "inputs":[{"name":"to","type":"address"},{"name":"qty","type":"uint256"}],"outputs":[]}]"#;
        let call = MintCall::from_abi_json(
            abi,
            "publicMint",
            &[json!("0x000000000000000000000000000000000000dEaD"), json!(3)],
        )
        .unwrap();
        assert_eq!(call.signature(), "publicMint(address,uint256)");
        assert_eq!(call.calldata().len(), 4 + 64);
    }

    #[test]
    fn array_arguments_are_coerced() {
        let call = MintCall::from_signature(
            "function claim(uint256[] ids)",
            &[json!([1, 2, 3])],
        )
        .unwrap();
        assert!(matches!(&call.args()[0], DynSolValue::Array(items) if items.len() == 3));
    }
}
