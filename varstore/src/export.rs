//! C source export of a sealed store, for test firmware that embeds the image.

use crate::store::SealedStore;

const BYTES_PER_LINE: usize = 16;

/// `unsigned char <name>[N] = { ... };` with sixteen `0xHH` bytes per line.
pub fn to_c_array(data: &[u8], name: &str) -> String {
    let lines: Vec<String> = data
        .chunks(BYTES_PER_LINE)
        .map(|line| {
            line.iter()
                .map(|b| format!("0x{b:02X}"))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect();
    format!(
        "unsigned char {name}[{}] = {{\n{}\n}};\n\n",
        data.len(),
        lines.join(",\n")
    )
}

/// Counter, IV and image as C declarations prefixed with `prefix`.
pub fn to_c_source(sealed: &SealedStore, prefix: &str) -> String {
    let mut source = format!("UINT32 {prefix}_rpmc = 0x{:x};\n\n", sealed.counter_value());
    source.push_str(&to_c_array(&sealed.init_vec, &format!("{prefix}_ivec")));
    source.push_str(&to_c_array(&sealed.image, &format!("{prefix}_var_fv")));
    source
}

#[cfg(test)]
mod tests {
    use super::{to_c_array, to_c_source};
    use crate::store::SealedStore;

    #[test]
    fn wraps_every_sixteen_bytes() {
        let data: Vec<u8> = (0u8..18).collect();
        let text = to_c_array(&data, "blob");
        let expected = "unsigned char blob[18] = {\n\
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,\n\
            0x10, 0x11\n\
            };\n\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn source_lists_counter_iv_and_image() {
        let sealed = SealedStore {
            image: vec![0xAB, 0xCD],
            init_vec: vec![0x01],
            counter: vec![0x77, 0x00, 0x00, 0x00],
            digest: None,
            encrypted: Vec::new(),
        };
        let text = to_c_source(&sealed, "tc1");
        assert!(text.starts_with("UINT32 tc1_rpmc = 0x77;\n\n"));
        assert!(text.contains("unsigned char tc1_ivec[1] = {\n0x01\n};"));
        assert!(text.ends_with("unsigned char tc1_var_fv[2] = {\n0xAB, 0xCD\n};\n\n"));
    }
}
