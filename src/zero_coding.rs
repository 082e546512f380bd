//! Run-length compression of zero bytes, applied to the payload of messages
//!  whose template carries the zero-coded flag.
//!
//! A run of `N` zero bytes is transmitted as the two bytes `0x00 N`; runs
//!  longer than 255 are split into multiple pairs. Bytes other than `0x00`
//!  are transmitted verbatim, so the encoding never produces a bare `0x00`.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;

pub fn zero_encode(src: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(src.len());

    let mut run: usize = 0;
    for &byte in src {
        if byte == 0 {
            run += 1;
            continue;
        }
        flush_run(&mut out, run);
        run = 0;
        out.put_u8(byte);
    }
    flush_run(&mut out, run);

    out
}

fn flush_run(out: &mut BytesMut, mut run: usize) {
    while run > 0 {
        let chunk = run.min(255);
        out.put_u8(0);
        out.put_u8(chunk as u8);
        run -= chunk;
    }
}

pub fn zero_decode(src: &[u8]) -> Result<BytesMut, ProtocolError> {
    let mut out = BytesMut::with_capacity(src.len());

    let mut iter = src.iter();
    while let Some(&byte) = iter.next() {
        if byte != 0 {
            out.put_u8(byte);
            continue;
        }
        match iter.next() {
            Some(&count) if count > 0 => out.put_bytes(0, count as usize),
            Some(_) => {
                return Err(ProtocolError::MalformedPayload(
                    "zero-coded run with length 0".to_owned(),
                ))
            }
            None => {
                return Err(ProtocolError::MalformedPayload(
                    "zero-coded payload ends inside a run".to_owned(),
                ))
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::no_zeros(vec![1, 2, 3, 0xFF], vec![1, 2, 3, 0xFF])]
    #[case::single_zero(vec![0], vec![0, 1])]
    #[case::wire_example(vec![0xAA, 0x00, 0x00, 0x00, 0xBB], vec![0xAA, 0x00, 0x03, 0xBB])]
    #[case::trailing_run(vec![7, 0, 0], vec![7, 0, 2])]
    #[case::leading_run(vec![0, 0, 9], vec![0, 2, 9])]
    fn test_encode(#[case] src: Vec<u8>, #[case] expected: Vec<u8>) {
        assert_eq!(zero_encode(&src).as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::no_zeros(vec![1, 2, 3])]
    #[case::wire_example(vec![0xAA, 0x00, 0x00, 0x00, 0xBB])]
    #[case::run_of_255(vec![0u8; 255])]
    #[case::run_of_256(vec![0u8; 256])]
    #[case::run_of_1000(vec![0u8; 1000])]
    #[case::mixed(vec![0, 1, 0, 0, 2, 0, 0, 0])]
    fn test_round_trip(#[case] src: Vec<u8>) {
        let encoded = zero_encode(&src);
        let decoded = zero_decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), src.as_slice());
    }

    #[test]
    fn test_encode_splits_long_runs() {
        let encoded = zero_encode(&vec![0u8; 300]);
        assert_eq!(encoded.as_ref(), &[0, 255, 0, 45]);
    }

    #[test]
    fn test_encode_without_zeros_is_identity() {
        let src: Vec<u8> = (1..=255).collect();
        assert_eq!(zero_encode(&src).as_ref(), src.as_slice());
    }

    #[rstest]
    #[case::truncated_run(vec![1, 0])]
    #[case::zero_length_run(vec![0, 0])]
    fn test_decode_rejects_malformed(#[case] src: Vec<u8>) {
        assert!(zero_decode(&src).is_err());
    }
}
