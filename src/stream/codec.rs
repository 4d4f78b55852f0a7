// =============================================================================
// OKX v5 WebSocket codec — control frames out, pushes and acks in
// =============================================================================
//
// Outbound:
//   {"id":"7","op":"subscribe","args":[{"channel":"tickers","instId":"BTC-USDT"}]}
//   {"id":"8","op":"subscribe","args":[{"channel":"candle1m","instId":"BTC-USDT"}]}
//
// Inbound:
//   {"id":"7","event":"subscribe","arg":{...},"connId":"..."}          ack
//   {"id":"9","event":"error","code":"60018","msg":"...","connId":""}  rejection
//   {"arg":{"channel":"tickers",...},"data":[{...}]}                   ticker push
//   {"arg":{"channel":"candle1m",...},"data":[["ts","o",...]]}         candle push
//   pong                                                                keep-alive
// =============================================================================

use serde::Deserialize;
use serde_json::Value;

use crate::error::{MirrorError, MirrorResult};
use crate::exchange::okx_client::{classify_code, parse_candle_row, OkxTicker};
use crate::market_data::Candle;
use crate::types::{Subscription, TickerSnapshot};

pub const PING_FRAME: &str = "ping";

/// Wire error code for "channel / instrument doesn't exist".
const CHANNEL_NOT_FOUND: &str = "60018";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Subscribe,
    Unsubscribe,
}

impl ControlOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl std::fmt::Display for ControlOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack {
        id: Option<String>,
        op: ControlOp,
        subscription: Option<Subscription>,
    },
    Error {
        id: Option<String>,
        error: MirrorError,
    },
    Tickers(Vec<TickerSnapshot>),
    Candles(Vec<Candle>),
    Pong,
    Notice(String),
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelArg {
    channel: String,
    #[serde(default)]
    inst_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<ChannelArg>,
    #[serde(default)]
    data: Option<Value>,
}

fn channel_for(sub: &Subscription) -> String {
    match &sub.interval {
        None => "tickers".to_string(),
        Some(iv) => format!("candle{iv}"),
    }
}

fn subscription_for(arg: &ChannelArg) -> Option<Subscription> {
    let symbol = arg.inst_id.clone()?;
    if arg.channel == "tickers" {
        Some(Subscription::ticker(symbol))
    } else {
        arg.channel
            .strip_prefix("candle")
            .map(|iv| Subscription::candle(symbol, iv))
    }
}

/// Build a subscribe/unsubscribe request carrying `id` for ack correlation.
pub fn control_frame(id: &str, op: ControlOp, sub: &Subscription) -> String {
    serde_json::json!({
        "id": id,
        "op": op.as_str(),
        "args": [{ "channel": channel_for(sub), "instId": sub.symbol }],
    })
    .to_string()
}

pub fn decode(text: &str) -> MirrorResult<Inbound> {
    if text == "pong" {
        return Ok(Inbound::Pong);
    }

    let frame: Frame = serde_json::from_str(text)?;

    if let Some(event) = frame.event.as_deref() {
        let subscription = frame.arg.as_ref().and_then(subscription_for);
        return Ok(match event {
            "subscribe" => Inbound::Ack {
                id: frame.id,
                op: ControlOp::Subscribe,
                subscription,
            },
            "unsubscribe" => Inbound::Ack {
                id: frame.id,
                op: ControlOp::Unsubscribe,
                subscription,
            },
            "error" => {
                let code = frame.code.unwrap_or_default();
                let msg = frame.msg.unwrap_or_default();
                let error = if code == CHANNEL_NOT_FOUND {
                    MirrorError::InvalidSymbol(msg)
                } else {
                    classify_code(&code, &msg)
                };
                Inbound::Error { id: frame.id, error }
            }
            "notice" => Inbound::Notice(frame.msg.unwrap_or_default()),
            _ => Inbound::Other,
        });
    }

    let (Some(arg), Some(data)) = (frame.arg, frame.data) else {
        return Ok(Inbound::Other);
    };

    if arg.channel == "tickers" {
        let rows: Vec<OkxTicker> = serde_json::from_value(data)?;
        let tickers = rows
            .into_iter()
            .map(OkxTicker::into_snapshot)
            .collect::<MirrorResult<Vec<_>>>()?;
        return Ok(Inbound::Tickers(tickers));
    }

    if let Some(interval) = arg.channel.strip_prefix("candle") {
        let symbol = arg
            .inst_id
            .ok_or_else(|| MirrorError::Decode("candle push without instId".into()))?;
        let rows: Vec<Vec<String>> = serde_json::from_value(data)?;
        let candles = rows
            .iter()
            .map(|row| parse_candle_row(&symbol, interval, row))
            .collect::<MirrorResult<Vec<_>>>()?;
        return Ok(Inbound::Candles(candles));
    }

    Ok(Inbound::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_shape() {
        let frame = control_frame("7", ControlOp::Subscribe, &Subscription::candle("BTC-USDT", "1H"));
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["id"], "7");
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["args"][0]["channel"], "candle1H");
        assert_eq!(v["args"][0]["instId"], "BTC-USDT");
    }

    #[test]
    fn decodes_ack() {
        let text = r#"{"id":"3","event":"unsubscribe","arg":{"channel":"tickers","instId":"ETH-USDT"},"connId":"a4d3ae55"}"#;
        assert_eq!(
            decode(text).unwrap(),
            Inbound::Ack {
                id: Some("3".into()),
                op: ControlOp::Unsubscribe,
                subscription: Some(Subscription::ticker("ETH-USDT")),
            }
        );
    }

    #[test]
    fn decodes_rejection_as_permanent() {
        let text = r#"{"id":"4","event":"error","code":"60018","msg":"Wrong URL or channel:tickers,instId:FOO-BAR doesn't exist.","connId":"x"}"#;
        match decode(text).unwrap() {
            Inbound::Error { id, error } => {
                assert_eq!(id.as_deref(), Some("4"));
                assert!(matches!(error, MirrorError::InvalidSymbol(_)));
                assert!(!error.is_transient());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_ticker_push() {
        let text = r#"{"arg":{"channel":"tickers","instId":"BTC-USDT"},"data":[{"instType":"SPOT","instId":"BTC-USDT","last":"9999.99","lastSz":"0.1","askPx":"9999.99","askSz":"11","bidPx":"8888.88","bidSz":"5","open24h":"9000","high24h":"10000","low24h":"8888.88","volCcy24h":"2222","vol24h":"2222","sodUtc0":"2222","sodUtc8":"2222","ts":"1597026383085"}]}"#;
        match decode(text).unwrap() {
            Inbound::Tickers(t) => {
                assert_eq!(t.len(), 1);
                assert_eq!(t[0].symbol, "BTC-USDT");
                assert_eq!(t[0].timestamp, 1_597_026_383_085);
                assert!((t[0].ask_size - 11.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_candle_push() {
        let text = r#"{"arg":{"channel":"candle1D","instId":"BTC-USDT"},"data":[["1597026383085","8533.02","8553.74","8527.17","8548.26","45247","529.5858061","529.5858061","0"]]}"#;
        match decode(text).unwrap() {
            Inbound::Candles(c) => {
                assert_eq!(c[0].interval, "1D");
                assert_eq!(c[0].symbol, "BTC-USDT");
                assert!(!c[0].confirmed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_pong_and_notice() {
        assert_eq!(decode("pong").unwrap(), Inbound::Pong);
        let notice = r#"{"event":"notice","code":"64008","msg":"The connection will soon be closed for a service upgrade.","connId":"a4d3ae55"}"#;
        assert!(matches!(decode(notice).unwrap(), Inbound::Notice(_)));
        assert!(decode("not json").is_err());
    }
}
