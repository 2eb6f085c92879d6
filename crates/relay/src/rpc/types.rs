use notify_relay_domain::{PayloadValue, StackInteger};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: T,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockResponse {
    pub index: u64,
    pub hash: String,
    #[serde(default)]
    pub tx: Vec<BlockTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockTransaction {
    pub txid: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl BlockTransaction {
    pub fn is_invocation(&self) -> bool {
        self.kind == "InvocationTransaction"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationLog {
    pub txid: String,
    #[serde(default)]
    pub executions: Vec<Execution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Execution {
    #[serde(default)]
    pub vmstate: String,
    #[serde(default)]
    pub notifications: Vec<RpcNotification>,
}

impl Execution {
    /// Notifications of faulted executions were rolled back.
    pub fn halted(&self) -> bool {
        self.vmstate.contains("HALT") && !self.vmstate.contains("FAULT")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcNotification {
    pub contract: String,
    pub state: ContractParameter,
}

/// `{"type": ..., "value": ...}` as rendered by the node.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractParameter {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

impl ContractParameter {
    pub fn to_payload(&self) -> Result<PayloadValue, String> {
        match self.kind.as_str() {
            "ByteArray" | "Hash160" | "Hash256" | "PublicKey" | "Signature" => {
                let raw = self.string_value()?;
                let raw = raw.strip_prefix("0x").unwrap_or(raw);
                hex::decode(raw)
                    .map(PayloadValue::Bytes)
                    .map_err(|err| format!("{}: {err}", self.kind))
            }
            "String" => Ok(PayloadValue::bytes(self.string_value()?.as_bytes())),
            "Integer" => {
                let parsed: i128 = match &self.value {
                    Value::String(raw) => raw
                        .trim()
                        .parse()
                        .map_err(|err| format!("Integer: {err}"))?,
                    Value::Number(num) => num
                        .as_i64()
                        .map(i128::from)
                        .ok_or_else(|| format!("Integer: {num} is not integral"))?,
                    other => return Err(format!("Integer: unexpected value {other}")),
                };
                Ok(PayloadValue::Integer(StackInteger::from_i128(parsed)))
            }
            "Boolean" => match &self.value {
                Value::Bool(flag) => Ok(PayloadValue::Boolean(*flag)),
                Value::String(raw) if raw.eq_ignore_ascii_case("true") => {
                    Ok(PayloadValue::Boolean(true))
                }
                Value::String(raw) if raw.eq_ignore_ascii_case("false") => {
                    Ok(PayloadValue::Boolean(false))
                }
                other => Err(format!("Boolean: unexpected value {other}")),
            },
            "Array" | "Struct" => {
                let items: Vec<ContractParameter> = serde_json::from_value(self.value.clone())
                    .map_err(|err| format!("{}: {err}", self.kind))?;
                items
                    .iter()
                    .map(ContractParameter::to_payload)
                    .collect::<Result<Vec<_>, _>>()
                    .map(PayloadValue::Array)
            }
            other => Err(format!("unsupported parameter type `{other}`")),
        }
    }

    fn string_value(&self) -> Result<&str, String> {
        match &self.value {
            Value::String(raw) => Ok(raw),
            Value::Null => Ok(""),
            other => Err(format!("{}: expected string, found {other}", self.kind)),
        }
    }
}
