use std::borrow::Borrow;
use std::fmt;

use bitcoin::FeeRate;
use log::warn;

pub(crate) const SUPPORTED_VERSIONS: &[u8] = &[1];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Params {
    // disableoutputsubstitution
    pub disable_output_substitution: bool,
    // maxadditionalfeecontribution, additionalfeeoutputindex
    pub additional_fee_contribution: Option<(bitcoin::Amount, usize)>,
    // minfeerate
    pub min_fee_rate: Option<FeeRate>,
}

impl Params {
    pub fn from_query_pairs<K, V, I>(pairs: I) -> Result<Self, Error>
    where
        I: Iterator<Item = (K, V)>,
        K: Borrow<str> + Into<String>,
        V: Borrow<str> + Into<String>,
    {
        let mut params = Params::default();

        let mut additional_fee_output_index = None;
        let mut max_additional_fee_contribution = None;

        for (k, v) in pairs {
            match (k.borrow(), v.borrow()) {
                ("v", version) =>
                    if !version.parse::<u8>().is_ok_and(|v| SUPPORTED_VERSIONS.contains(&v)) {
                        return Err(Error::UnknownVersion { supported_versions: SUPPORTED_VERSIONS });
                    },
                ("additionalfeeoutputindex", index) =>
                    additional_fee_output_index = match index.parse::<usize>() {
                        Ok(index) => Some(index),
                        Err(error) => {
                            warn!("bad `additionalfeeoutputindex` query value '{index}': {error}");
                            None
                        }
                    },
                ("maxadditionalfeecontribution", fee) =>
                    max_additional_fee_contribution =
                        match bitcoin::Amount::from_str_in(fee, bitcoin::Denomination::Satoshi) {
                            Ok(contribution) => Some(contribution),
                            Err(error) => {
                                warn!(
                                    "bad `maxadditionalfeecontribution` query value '{fee}': {error}"
                                );
                                None
                            }
                        },
                ("minfeerate", fee_rate) =>
                    params.min_fee_rate = match fee_rate.parse::<f32>() {
                        Ok(fee_rate_sat_per_vb) if fee_rate_sat_per_vb.is_finite() && fee_rate_sat_per_vb >= 0.0 => {
                            let fee_rate_sat_per_kwu = fee_rate_sat_per_vb * 250.0_f32;
                            // since it's a minimum, we want to round up
                            Some(FeeRate::from_sat_per_kwu(fee_rate_sat_per_kwu.ceil() as u64))
                        }
                        Ok(_) => return Err(Error::FeeRate(format!("{fee_rate} is out of range"))),
                        Err(e) => return Err(Error::FeeRate(e.to_string())),
                    },
                ("disableoutputsubstitution", v) =>
                    params.disable_output_substitution = v == "true",
                _ => (),
            }
        }

        match (max_additional_fee_contribution, additional_fee_output_index) {
            (Some(amount), Some(index)) =>
                params.additional_fee_contribution = Some((amount, index)),
            (Some(_), None) | (None, Some(_)) => {
                warn!("only one additional-fee parameter specified: {params:?}");
            }
            _ => (),
        }

        log::debug!("parsed optional parameters: {params:?}");
        Ok(params)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Error {
    UnknownVersion { supported_versions: &'static [u8] },
    FeeRate(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnknownVersion { .. } => write!(f, "unknown version"),
            Error::FeeRate(e) => write!(f, "could not parse feerate: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> { None }
}

#[cfg(test)]
mod test {
    use bitcoin::{Amount, FeeRate};

    use super::*;

    fn parse(query: &str) -> Result<Params, Error> {
        Params::from_query_pairs(url::form_urlencoded::parse(query.as_bytes()))
    }

    #[test]
    fn test_parse_params() {
        let params = parse("v=1&maxadditionalfeecontribution=182&additionalfeeoutputindex=0&minfeerate=2")
            .expect("valid params");
        assert_eq!(params.additional_fee_contribution, Some((Amount::from_sat(182), 0)));
        assert_eq!(params.min_fee_rate, Some(FeeRate::from_sat_per_vb_unchecked(2)));
        assert!(!params.disable_output_substitution);
    }

    #[test]
    fn only_version_one_is_supported() {
        assert_eq!(parse("v=2"), Err(Error::UnknownVersion { supported_versions: &[1] }));
        assert_eq!(parse("v=abc"), Err(Error::UnknownVersion { supported_versions: &[1] }));
        assert!(parse("v=1").is_ok());
    }

    #[test]
    fn incomplete_fee_contribution_is_ignored() {
        let params = parse("maxadditionalfeecontribution=182").expect("valid params");
        assert_eq!(params.additional_fee_contribution, None);

        let params =
            parse("maxadditionalfeecontribution=abc&additionalfeeoutputindex=1").expect("valid");
        assert_eq!(params.additional_fee_contribution, None);
    }

    #[test]
    fn min_fee_rate_rounds_up() {
        let params = parse("minfeerate=1.001").expect("valid params");
        assert_eq!(params.min_fee_rate, Some(FeeRate::from_sat_per_kwu(251)));
        assert!(matches!(parse("minfeerate=fast"), Err(Error::FeeRate(_))));
        assert!(matches!(parse("minfeerate=-1"), Err(Error::FeeRate(_))));
    }
}
