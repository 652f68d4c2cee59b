#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use crate::{
        analysis::Program,
        codegen::CodeGen,
        config::{DataPolicy, Directives, TranslatorOptions},
        decoder::CapstoneDisassembler,
        parser::{build_mz, parse_mz},
        report::Report,
        store::InstructionStore,
        Address, ErrorClass, TranslateError,
    };

    /// "Hello$" in a 16-byte data paragraph, then code at 0x10:
    ///
    /// ```text
    /// 0010  mov ax, seg data    ; relocated
    /// 0013  mov ds, ax
    /// 0015  call 001f
    /// 0018  mov ax, 4c00h
    /// 001b  int 21h
    /// 001d  jmp 001d
    /// 001f  mov dx, 0
    /// 0022  mov ah, 9
    /// 0024  int 21h
    /// 0026  mov cx, 3
    /// 0029  dec cx
    /// 002a  jnz 0029
    /// 002c  ret
    /// ```
    fn hello_module() -> Vec<u8> {
        let mut module = b"Hello$".to_vec();
        module.resize(0x10, 0);
        module.extend_from_slice(&[
            0xb8, 0x00, 0x00, // mov ax, 0
            0x8e, 0xd8, // mov ds, ax
            0xe8, 0x07, 0x00, // call 0x1f
            0xb8, 0x00, 0x4c, // mov ax, 0x4c00
            0xcd, 0x21, // int 0x21
            0xeb, 0xfe, // jmp 0x1d
            0xba, 0x00, 0x00, // mov dx, 0
            0xb4, 0x09, // mov ah, 9
            0xcd, 0x21, // int 0x21
            0xb9, 0x03, 0x00, // mov cx, 3
            0x49, // dec cx
            0x75, 0xfd, // jnz 0x29
            0xc3, // ret
        ]);
        build_mz(&module, &[(0, 0x11)], (0, 0x10), (0x10, 0x100), 0x20)
    }

    fn translate(exe: &[u8], directives: &Directives) -> Result<(Program, String), TranslateError> {
        let options = TranslatorOptions::default();
        let image = parse_mz(exe, options.load_segment)?;
        let mut store = InstructionStore::new(
            &image,
            Box::new(CapstoneDisassembler::new()?),
            &options,
        );
        store.install_patches(&directives.patches)?;
        let program = Program::analyze(&mut store, &image, &options)?;
        let hooks = directives.hook_table()?;
        let source = CodeGen::new(&hooks).program(&program)?;
        Ok((program, source))
    }

    #[test]
    fn test_translate_hello() {
        let (program, source) = translate(&hello_module(), &Directives::default()).unwrap();

        assert_eq!(program.entry, Address::new(0x1000, 0x10));
        let entries: Vec<u32> = program.subroutines.keys().copied().collect();
        assert_eq!(entries, vec![0x10010, 0x1001f]);
        assert_eq!(program.instruction_count(), 13);
        assert_eq!(program.data_image.len(), 0x10);

        assert!(source.contains("static void sub_10010(struct cpu *caller);"));
        assert!(source.contains("static void sub_1001F(struct cpu *caller)\n{"));
        // The relocation turned `mov ax, 0` into the data segment.
        assert!(source.contains("r.ax = 0x1000;"));
        assert!(source.contains("r.ds = r.ax;"));
        assert!(source.contains("push16(&r, 0x0018); sub_1001F(&r);"));
        assert!(source.contains("interrupt(&r, 0x21);"));
        assert!(source.contains("goto loc_1001D;"));
        assert!(source.contains("if (!ZF) goto loc_10029;"));
        assert!(source.contains("loc_10029:;"));
        assert!(source.contains("0x48, 0x65, 0x6C, 0x6C, 0x6F, 0x24"));
        assert!(source.contains("    cpu->ss = 0x1010;\n    cpu->sp = 0x0100;\n"));
    }

    #[test]
    fn test_output_file_and_report() {
        let (program, source) = translate(&hello_module(), &Directives::default()).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.c");
        fs::write(&path, &source).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, source);
        assert!(written.ends_with("    sub_10010(cpu);\n}\n"));

        let report = Report::from_program(&program);
        assert_eq!(report.subroutines.len(), 2);
        assert_eq!(report.subroutines[0].callees, vec!["1000:001F".to_string()]);
        assert_eq!(report.subroutines[1].instructions, 7);
    }

    #[test]
    fn test_hooks_are_placed() {
        let directives = Directives::from_json(
            r#"{"hooks": [{"address": "1000:0029", "code": "tick(&r);"}]}"#,
        )
        .unwrap();
        let (_, source) = translate(&hello_module(), &directives).unwrap();
        assert!(source.contains("loc_10029:;\n    tick(&r);\n"));
    }

    /// `mov bx, 0x17; call bx; jmp $; ret`
    fn indirect_module() -> Vec<u8> {
        let code = [0xbb, 0x17, 0x00, 0xff, 0xd3, 0xeb, 0xfe, 0xc3];
        let mut module = vec![0u8; 0x10];
        module.extend_from_slice(&code);
        build_mz(&module, &[], (0, 0x10), (0x10, 0x80), 0)
    }

    #[test]
    fn test_indirect_call_needs_a_patch() {
        let err = translate(&indirect_module(), &Directives::default()).unwrap_err();
        assert_eq!(err.class(), ErrorClass::ControlFlow);
        match err {
            TranslateError::DynamicBranch { address, .. } => {
                assert_eq!(address, Address::new(0x1000, 0x13));
            }
            other => panic!("unexpected {:?}", other),
        }

        let directives = Directives::from_json(
            r#"{"patches": [{"address": "1000:0013", "bytes": "ff d3", "instruction": "call 1000:0017"}]}"#,
        )
        .unwrap();
        let (program, source) = translate(&indirect_module(), &directives).unwrap();
        assert_eq!(program.subroutines.len(), 2);
        assert!(source.contains("push16(&r, 0x0015); sub_10017(&r);"));
    }

    #[test]
    fn test_full_image_policy() {
        let options = TranslatorOptions {
            data_policy: DataPolicy::FullImage,
            ..TranslatorOptions::default()
        };
        let exe = hello_module();
        let image = parse_mz(&exe, options.load_segment).unwrap();
        let mut store = InstructionStore::new(
            &image,
            Box::new(CapstoneDisassembler::new().unwrap()),
            &options,
        );
        let program = Program::analyze(&mut store, &image, &options).unwrap();
        assert_eq!(program.data_image, image.bytes);

        let hooks = HashMap::new();
        let source = CodeGen::new(&hooks).program(&program).unwrap();
        assert!(source.contains(&format!("#define DATA_SIZE {}u", image.bytes.len())));
    }
}
